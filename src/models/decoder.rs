//! GPT-2 style transformer decoder
//!
//! Implements the causal decoder the metrics layer sits on:
//! - Learned token and position embeddings
//! - Pre-norm blocks with fused-qkv causal self-attention
//! - GELU feed-forward
//! - Tied embedding / LM head weights (logits = hidden · wteᵀ)
//!
//! Parameter names follow the GPT-2 checkpoint layout (`wte.weight`,
//! `h.{i}.attn.c_attn.weight`, ...), so reference weights map over
//! directly after the Conv1D transposition in [`crate::convert`].

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{LayerNorm, Linear, Module};
use std::collections::HashMap;

use super::kv_cache::{KvCache, LayerKvCache};
use crate::config::{Activation, DecoderConfig};
use crate::init::Initializer;

/// Layer norm that keeps its parameter tensors addressable by name
#[derive(Debug, Clone)]
struct Norm {
    gain: Tensor,
    bias: Tensor,
    norm: LayerNorm,
}

impl Norm {
    fn new(gain: Tensor, bias: Tensor, eps: f64) -> Self {
        let norm = LayerNorm::new(gain.clone(), bias.clone(), eps);
        Self { gain, bias, norm }
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.norm.forward(x)
    }
}

/// Multi-head causal self-attention with a fused qkv projection
#[derive(Debug, Clone)]
struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    fn forward(&self, x: &Tensor, cache: Option<&mut LayerKvCache>) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        let dim = self.num_heads * self.head_dim;

        let qkv = self.c_attn.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, dim)?;
        let k = qkv.narrow(D::Minus1, dim, dim)?;
        let v = qkv.narrow(D::Minus1, 2 * dim, dim)?;

        // (batch, heads, seq, head_dim)
        let split = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(q)?;
        let k = split(k)?;
        let v = split(v)?;

        let (k, v) = match cache {
            Some(cache) => cache.append(&k, &v)?,
            None => (k, v),
        };
        let kv_len = k.dim(2)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? / scale)?;

        // A single-token query attends to the whole cache, no mask needed.
        let attn = if seq_len > 1 {
            let mask = causal_mask(seq_len, kv_len, x.device())?;
            let neg_inf = Tensor::new(f32::NEG_INFINITY, x.device())?;
            mask.broadcast_as(attn.shape())?
                .where_cond(&attn, &neg_inf.broadcast_as(attn.shape())?)?
        } else {
            attn
        };

        let attn = candle_nn::ops::softmax(&attn, D::Minus1)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, dim))?;
        self.c_proj.forward(&out).map_err(Into::into)
    }
}

/// Causal attention mask as u8 (1 = attend, 0 = mask), shaped (1, 1, q, kv)
fn causal_mask(query_len: usize, key_len: usize, device: &Device) -> Result<Tensor> {
    let start_pos = key_len.saturating_sub(query_len);
    let mut data = vec![0u8; query_len * key_len];
    for q in 0..query_len {
        for k in 0..key_len {
            if k <= start_pos + q {
                data[q * key_len + k] = 1;
            }
        }
    }
    let mask = Tensor::from_slice(&data, (query_len, key_len), device)?;
    mask.unsqueeze(0)?.unsqueeze(0).map_err(Into::into)
}

/// Position-wise feed-forward block
#[derive(Debug, Clone)]
struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    activation: Activation,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?;
        let h = self.activation.apply(&h)?;
        self.c_proj.forward(&h).map_err(Into::into)
    }
}

/// One pre-norm decoder block
#[derive(Debug, Clone)]
struct DecoderLayer {
    ln_1: Norm,
    attn: CausalSelfAttention,
    ln_2: Norm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn forward(&self, x: &Tensor, cache: Option<&mut LayerKvCache>) -> Result<Tensor> {
        let attn_out = self.attn.forward(&self.ln_1.forward(x)?, cache)?;
        let x = (x + attn_out)?;
        let mlp_out = self.mlp.forward(&self.ln_2.forward(&x)?)?;
        (&x + mlp_out).map_err(Into::into)
    }
}

/// GPT-2 style causal decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    wte: Tensor,
    wpe: Tensor,
    layers: Vec<DecoderLayer>,
    ln_f: Norm,
    config: DecoderConfig,
    device: Device,
}

impl Decoder {
    /// Build with randomly initialized parameters
    pub fn new_random(config: DecoderConfig, init: &Initializer, device: &Device) -> Result<Self> {
        config.validate()?;
        let dim = config.hidden_dim;
        let eps = config.layer_norm_epsilon;

        let linear = |name: &str, out_dim: usize, in_dim: usize| -> Result<Linear> {
            let w = init.weight(name, &[out_dim, in_dim], device)?;
            let b = init.bias(out_dim, device)?;
            Ok(Linear::new(w, Some(b)))
        };
        let norm = |_name: &str| -> Result<Norm> {
            Ok(Norm::new(
                init.ln_gain(dim, device)?,
                init.bias(dim, device)?,
                eps,
            ))
        };

        let wte = init.weight("wte.weight", &[config.vocab_size, dim], device)?;
        let wpe = init.weight("wpe.weight", &[config.max_position_embeddings, dim], device)?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(DecoderLayer {
                ln_1: norm(&format!("h.{i}.ln_1"))?,
                attn: CausalSelfAttention {
                    c_attn: linear(&format!("h.{i}.attn.c_attn.weight"), 3 * dim, dim)?,
                    c_proj: linear(&format!("h.{i}.attn.c_proj.weight"), dim, dim)?,
                    num_heads: config.num_heads,
                    head_dim: config.head_dim(),
                },
                ln_2: norm(&format!("h.{i}.ln_2"))?,
                mlp: Mlp {
                    c_fc: linear(&format!("h.{i}.mlp.c_fc.weight"), 4 * dim, dim)?,
                    c_proj: linear(&format!("h.{i}.mlp.c_proj.weight"), dim, 4 * dim)?,
                    activation: config.activation,
                },
            });
        }

        let ln_f = norm("ln_f")?;
        Ok(Self {
            wte,
            wpe,
            layers,
            ln_f,
            config,
            device: device.clone(),
        })
    }

    /// Build from a canonical name → tensor map (see [`parameter_names`])
    pub fn from_tensors(
        config: DecoderConfig,
        tensors: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let dim = config.hidden_dim;
        let eps = config.layer_norm_epsilon;

        let take = |name: &str, shape: &[usize]| -> Result<Tensor> {
            let t = tensors
                .get(name)
                .with_context(|| format!("Missing parameter: {name}"))?;
            if t.dims() != shape {
                bail!(
                    "Parameter {name} has shape {:?}, expected {:?}",
                    t.dims(),
                    shape
                );
            }
            t.to_dtype(DType::F32)?.to_device(device).map_err(Into::into)
        };
        let linear = |name: &str, out_dim: usize, in_dim: usize| -> Result<Linear> {
            let w = take(&format!("{name}.weight"), &[out_dim, in_dim])?;
            let b = take(&format!("{name}.bias"), &[out_dim])?;
            Ok(Linear::new(w, Some(b)))
        };
        let norm = |name: &str| -> Result<Norm> {
            Ok(Norm::new(
                take(&format!("{name}.weight"), &[dim])?,
                take(&format!("{name}.bias"), &[dim])?,
                eps,
            ))
        };

        let wte = take("wte.weight", &[config.vocab_size, dim])?;
        let wpe = take("wpe.weight", &[config.max_position_embeddings, dim])?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(DecoderLayer {
                ln_1: norm(&format!("h.{i}.ln_1"))?,
                attn: CausalSelfAttention {
                    c_attn: linear(&format!("h.{i}.attn.c_attn"), 3 * dim, dim)?,
                    c_proj: linear(&format!("h.{i}.attn.c_proj"), dim, dim)?,
                    num_heads: config.num_heads,
                    head_dim: config.head_dim(),
                },
                ln_2: norm(&format!("h.{i}.ln_2"))?,
                mlp: Mlp {
                    c_fc: linear(&format!("h.{i}.mlp.c_fc"), 4 * dim, dim)?,
                    c_proj: linear(&format!("h.{i}.mlp.c_proj"), dim, 4 * dim)?,
                    activation: config.activation,
                },
            });
        }

        let ln_f = norm("ln_f")?;
        Ok(Self {
            wte,
            wpe,
            layers,
            ln_f,
            config,
            device: device.clone(),
        })
    }

    /// Forward pass over a full sequence (or one token when a cache holds
    /// the prefix), returning logits of shape (batch, seq, vocab)
    pub fn forward(&self, input_ids: &Tensor, mut cache: Option<&mut KvCache>) -> Result<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        let pos_offset = cache.as_ref().map(|c| c.seq_len()).unwrap_or(0);
        if pos_offset + seq_len > self.config.max_position_embeddings {
            bail!(
                "sequence of {} tokens at offset {} exceeds max_position_embeddings {}",
                seq_len,
                pos_offset,
                self.config.max_position_embeddings
            );
        }

        let ids = input_ids.to_dtype(DType::U32)?.flatten_all()?;
        let tok_emb = self
            .wte
            .index_select(&ids, 0)?
            .reshape((batch_size, seq_len, self.config.hidden_dim))?;
        let pos_emb = self.wpe.i(pos_offset..pos_offset + seq_len)?;
        let mut hidden = tok_emb.broadcast_add(&pos_emb.unsqueeze(0)?)?;

        for (i, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.as_mut().map(|c| &mut c.layers[i]);
            hidden = layer.forward(&hidden, layer_cache)?;
        }

        let hidden = self.ln_f.forward(&hidden)?;
        // Tied LM head
        hidden
            .broadcast_matmul(&self.wte.t()?)
            .map_err(Into::into)
    }

    /// Fresh KV cache sized to the position-embedding horizon
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.config.num_layers, self.config.max_position_embeddings)
    }

    /// Decoder configuration
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Device the parameters live on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// All parameters by canonical name
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = vec![
            ("wte.weight".to_string(), self.wte.clone()),
            ("wpe.weight".to_string(), self.wpe.clone()),
        ];
        let linear = |params: &mut Vec<(String, Tensor)>, name: String, l: &Linear| {
            params.push((format!("{name}.weight"), l.weight().clone()));
            if let Some(b) = l.bias() {
                params.push((format!("{name}.bias"), b.clone()));
            }
        };
        let norm = |params: &mut Vec<(String, Tensor)>, name: String, n: &Norm| {
            params.push((format!("{name}.weight"), n.gain.clone()));
            params.push((format!("{name}.bias"), n.bias.clone()));
        };
        for (i, layer) in self.layers.iter().enumerate() {
            norm(&mut params, format!("h.{i}.ln_1"), &layer.ln_1);
            linear(&mut params, format!("h.{i}.attn.c_attn"), &layer.attn.c_attn);
            linear(&mut params, format!("h.{i}.attn.c_proj"), &layer.attn.c_proj);
            norm(&mut params, format!("h.{i}.ln_2"), &layer.ln_2);
            linear(&mut params, format!("h.{i}.mlp.c_fc"), &layer.mlp.c_fc);
            linear(&mut params, format!("h.{i}.mlp.c_proj"), &layer.mlp.c_proj);
        }
        norm(&mut params, "ln_f".to_string(), &self.ln_f);
        params
    }
}

/// Canonical parameter names for a given config
pub fn parameter_names(config: &DecoderConfig) -> Vec<String> {
    let mut names = vec!["wte.weight".to_string(), "wpe.weight".to_string()];
    for i in 0..config.num_layers {
        for part in [
            "ln_1", "attn.c_attn", "attn.c_proj", "ln_2", "mlp.c_fc", "mlp.c_proj",
        ] {
            names.push(format!("h.{i}.{part}.weight"));
            names.push(format!("h.{i}.{part}.bias"));
        }
    }
    names.push("ln_f.weight".to_string());
    names.push("ln_f.bias".to_string());
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Decoder {
        let cfg = DecoderConfig::gpt2(2, 16, 4, 24, 11);
        Decoder::new_random(cfg, &Initializer::gpt2(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let model = tiny();
        let ids = Tensor::new(&[[1u32, 2, 3, 4, 5]], &Device::Cpu).unwrap();
        let logits = model.forward(&ids, None).unwrap();
        assert_eq!(logits.dims3().unwrap(), (1, 5, 24));
    }

    #[test]
    fn test_forward_rejects_long_sequence() {
        let model = tiny();
        let ids = Tensor::zeros((1, 12), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward(&ids, None).is_err());
    }

    #[test]
    fn test_cached_decoding_matches_full_forward() {
        let model = tiny();
        let ids: Vec<u32> = vec![3, 7, 1, 9, 4, 2];
        let full = model
            .forward(
                &Tensor::from_slice(&ids, (1, ids.len()), &Device::Cpu).unwrap(),
                None,
            )
            .unwrap();

        let mut cache = model.new_cache();
        let mut last = None;
        for &id in &ids {
            let step = Tensor::new(&[[id]], &Device::Cpu).unwrap();
            last = Some(model.forward(&step, Some(&mut cache)).unwrap());
        }

        let full_last: Vec<f32> = full
            .i((0, ids.len() - 1, ..))
            .unwrap()
            .to_vec1()
            .unwrap();
        let step_last: Vec<f32> = last.unwrap().i((0, 0, ..)).unwrap().to_vec1().unwrap();
        for (a, b) in full_last.iter().zip(step_last.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_causal_mask_layout() {
        let mask = causal_mask(2, 4, &Device::Cpu).unwrap();
        let rows: Vec<Vec<u8>> = mask
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(rows, vec![vec![1, 1, 1, 0], vec![1, 1, 1, 1]]);
    }

    #[test]
    fn test_named_parameters_complete() {
        let model = tiny();
        let names: Vec<String> = model
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, parameter_names(model.config()));
    }

    #[test]
    fn test_from_tensors_round_trip() {
        let model = tiny();
        let map: HashMap<String, Tensor> = model.named_parameters().into_iter().collect();
        let rebuilt =
            Decoder::from_tensors(model.config().clone(), &map, &Device::Cpu).unwrap();
        let ids = Tensor::new(&[[5u32, 9, 2]], &Device::Cpu).unwrap();
        let a: Vec<f32> = model
            .forward(&ids, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = rebuilt
            .forward(&ids, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_tensors_missing_param() {
        let model = tiny();
        let mut map: HashMap<String, Tensor> = model.named_parameters().into_iter().collect();
        map.remove("ln_f.bias");
        assert!(Decoder::from_tensors(model.config().clone(), &map, &Device::Cpu).is_err());
    }
}
