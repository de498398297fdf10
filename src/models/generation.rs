//! Autoregressive decoding
//!
//! Incremental generation over the KV cache with:
//! - Temperature scaling
//! - Top-k / top-p (nucleus) filtering
//! - Optional end-of-sequence stop token

use anyhow::{bail, Result};
use candle_core::{IndexOp, Tensor, D};
use rand::Rng;

use super::decoder::Decoder;

/// Decoding parameters
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Maximum number of new tokens to generate
    pub max_new_tokens: usize,
    /// Softmax temperature (1.0 = no change, 0.0 = greedy)
    pub temperature: f32,
    /// Top-k filtering (0 = disabled)
    pub top_k: usize,
    /// Top-p nucleus filtering (1.0 = disabled)
    pub top_p: f32,
    /// Stop token id, if the model has one
    pub eos_token: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            eos_token: None,
        }
    }
}

/// Token sampler over a logit row
pub struct Sampler {
    rng: rand::rngs::ThreadRng,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    /// Sampler backed by the thread-local RNG
    pub fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
        }
    }

    /// Apply temperature scaling
    pub fn apply_temperature(&self, logits: &Tensor, temperature: f32) -> Result<Tensor> {
        if temperature == 1.0 {
            return Ok(logits.clone());
        }
        (logits / temperature as f64).map_err(Into::into)
    }

    /// Keep only the k largest logits, masking the rest to -inf
    pub fn apply_top_k(&self, logits: &Tensor, k: usize) -> Result<Tensor> {
        let vocab_size = logits.dim(D::Minus1)?;
        if k == 0 || k >= vocab_size {
            return Ok(logits.clone());
        }
        let (sorted, _) = logits.sort_last_dim(false)?;
        let threshold = sorted.i(k - 1)?.to_scalar::<f32>()?;
        let values: Vec<f32> = logits.to_vec1()?;
        let filtered: Vec<f32> = values
            .into_iter()
            .map(|v| if v >= threshold { v } else { f32::NEG_INFINITY })
            .collect();
        Tensor::from_slice(&filtered, (vocab_size,), logits.device()).map_err(Into::into)
    }

    /// Keep the smallest set of tokens whose probability mass reaches p
    pub fn apply_top_p(&self, logits: &Tensor, p: f32) -> Result<Tensor> {
        if p >= 1.0 {
            return Ok(logits.clone());
        }
        let vocab_size = logits.dim(D::Minus1)?;
        let probs: Vec<f32> = candle_nn::ops::softmax(logits, D::Minus1)?.to_vec1()?;
        let mut order: Vec<usize> = (0..vocab_size).collect();
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

        let mut keep = vec![false; vocab_size];
        let mut cumulative = 0.0f32;
        for &idx in &order {
            keep[idx] = true;
            cumulative += probs[idx];
            if cumulative >= p {
                break;
            }
        }

        let values: Vec<f32> = logits.to_vec1()?;
        let filtered: Vec<f32> = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| if keep[i] { v } else { f32::NEG_INFINITY })
            .collect();
        Tensor::from_slice(&filtered, (vocab_size,), logits.device()).map_err(Into::into)
    }

    /// Draw a token from filtered logits
    pub fn sample(&mut self, logits: &Tensor, config: &GenerationConfig) -> Result<u32> {
        if config.temperature <= 0.0 {
            return Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?);
        }
        let logits = self.apply_temperature(logits, config.temperature)?;
        let logits = self.apply_top_k(&logits, config.top_k)?;
        let logits = self.apply_top_p(&logits, config.top_p)?;
        let probs: Vec<f32> = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec1()?;

        let draw: f32 = self.rng.gen();
        let mut cumulative = 0.0f32;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if draw < cumulative {
                return Ok(i as u32);
            }
        }
        // Rounding can leave the cumulative sum a hair under 1.
        Ok((probs.len() - 1) as u32)
    }
}

/// Generate a continuation of `prompt` (token ids)
///
/// Stops at the eos token, at `max_new_tokens`, or when the position
/// embedding table runs out, whichever comes first. Returns only the
/// newly generated tokens.
pub fn generate(decoder: &Decoder, prompt: &[u32], config: &GenerationConfig) -> Result<Vec<u32>> {
    if prompt.is_empty() {
        bail!("generation needs a non-empty prompt");
    }
    let device = decoder.device().clone();
    let max_pos = decoder.config().max_position_embeddings;
    if prompt.len() >= max_pos {
        bail!(
            "prompt of {} tokens leaves no room under max_position_embeddings {}",
            prompt.len(),
            max_pos
        );
    }

    let mut sampler = Sampler::new();
    let mut cache = decoder.new_cache();

    // Prime the cache with the whole prompt.
    let input = Tensor::from_slice(prompt, (1, prompt.len()), &device)?;
    let logits = decoder.forward(&input, Some(&mut cache))?;
    let mut last = logits.i((0, prompt.len() - 1, ..))?;

    let budget = config.max_new_tokens.min(max_pos - prompt.len());
    let mut generated = Vec::with_capacity(budget);
    for _ in 0..budget {
        let token = sampler.sample(&last, config)?;
        if Some(token) == config.eos_token {
            break;
        }
        generated.push(token);
        if generated.len() == budget {
            break;
        }
        let step = Tensor::new(&[[token]], &device)?;
        let logits = decoder.forward(&step, Some(&mut cache))?;
        last = logits.i((0, 0, ..))?;
    }
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::init::Initializer;
    use candle_core::Device;

    #[test]
    fn test_generation_config_default() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_new_tokens, 128);
        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.eos_token, None);
    }

    #[test]
    fn test_greedy_sampling_picks_argmax() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[0.1f32, 5.0, 0.2, 0.3], &device).unwrap();
        let mut sampler = Sampler::new();
        let config = GenerationConfig {
            temperature: 0.0,
            ..Default::default()
        };
        assert_eq!(sampler.sample(&logits, &config).unwrap(), 1);
    }

    #[test]
    fn test_top_k_masks_tail() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[1.0f32, 4.0, 2.0, 3.0], &device).unwrap();
        let sampler = Sampler::new();
        let filtered: Vec<f32> = sampler
            .apply_top_k(&logits, 2)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(filtered[0], f32::NEG_INFINITY);
        assert_eq!(filtered[1], 4.0);
        assert_eq!(filtered[2], f32::NEG_INFINITY);
        assert_eq!(filtered[3], 3.0);
    }

    #[test]
    fn test_top_p_keeps_head() {
        let device = Device::Cpu;
        // softmax gives ~[0.64, 0.23, 0.09, 0.03]
        let logits = Tensor::new(&[3.0f32, 2.0, 1.0, 0.0], &device).unwrap();
        let sampler = Sampler::new();
        let filtered: Vec<f32> = sampler
            .apply_top_p(&logits, 0.8)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(filtered[0], 3.0);
        assert_eq!(filtered[1], 2.0);
        assert_eq!(filtered[2], f32::NEG_INFINITY);
        assert_eq!(filtered[3], f32::NEG_INFINITY);
    }

    #[test]
    fn test_generate_respects_budget() {
        let cfg = DecoderConfig::gpt2(1, 8, 2, 12, 10);
        let decoder = Decoder::new_random(cfg, &Initializer::gpt2(), &Device::Cpu).unwrap();
        let config = GenerationConfig {
            max_new_tokens: 4,
            temperature: 0.0,
            ..Default::default()
        };
        let out = generate(&decoder, &[1, 2, 3], &config).unwrap();
        assert!(out.len() <= 4);
        assert!(out.iter().all(|&t| t < 12));
    }

    #[test]
    fn test_generate_rejects_oversized_prompt() {
        let cfg = DecoderConfig::gpt2(1, 8, 2, 12, 4);
        let decoder = Decoder::new_random(cfg, &Initializer::gpt2(), &Device::Cpu).unwrap();
        let prompt: Vec<u32> = vec![1, 2, 3, 4];
        assert!(generate(&decoder, &prompt, &GenerationConfig::default()).is_err());
    }
}
