//! Causal language model
//!
//! Wraps the decoder with the loss/metrics layer: forward produces the
//! scalar training loss alongside logits, per-token losses, and the
//! summaries a [`MetricAccumulator`](crate::metrics::MetricAccumulator)
//! consumes.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;

use super::decoder::Decoder;
use crate::config::ModelConfig;
use crate::init::Initializer;
use crate::metrics::{compute_metrics, MetricsOutput, Summaries};

/// One batch of model inputs
#[derive(Debug, Clone)]
pub struct InputBatch {
    /// Token ids, shape (batch, seq)
    pub input_ids: Tensor,
    /// Target labels (i64, shape (batch, seq)); pad or negative labels
    /// are excluded from the loss
    pub target_labels: Option<Tensor>,
    /// Raw byte count per example, for bits-per-byte
    pub target_num_bytes: Option<Tensor>,
}

impl InputBatch {
    /// A batch with inputs only (prediction, no loss)
    pub fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            target_labels: None,
            target_num_bytes: None,
        }
    }
}

/// Outputs of [`CausalLm::forward`]
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Mean loss over live targets (zero when the batch has no labels)
    pub loss: f32,
    /// Logits, shape (batch, seq, vocab)
    pub logits: Tensor,
    /// Per-token loss after masking
    pub per_token_loss: Option<Tensor>,
    /// Metric summaries for this batch
    pub summaries: Summaries,
}

/// Autoregressive language model with a metrics layer
#[derive(Debug, Clone)]
pub struct CausalLm {
    decoder: Decoder,
    pad_token_id: i64,
}

impl CausalLm {
    /// Build with randomly initialized parameters
    pub fn new_random(config: &ModelConfig, init: &Initializer, device: &Device) -> Result<Self> {
        let decoder = Decoder::new_random(config.decoder.clone(), init, device)?;
        Ok(Self {
            pad_token_id: config.decoder.pad_token_id,
            decoder,
        })
    }

    /// Build from pre-loaded parameter tensors
    pub fn from_tensors(
        config: &ModelConfig,
        tensors: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let decoder = Decoder::from_tensors(config.decoder.clone(), tensors, device)?;
        Ok(Self {
            pad_token_id: config.decoder.pad_token_id,
            decoder,
        })
    }

    /// Wrap an existing decoder
    pub fn from_decoder(decoder: Decoder) -> Self {
        Self {
            pad_token_id: decoder.config().pad_token_id,
            decoder,
        }
    }

    /// Forward pass: logits, loss, and metric summaries
    ///
    /// The returned loss always equals the `loss` summary produced by
    /// [`CausalLm::metrics`] on the same logits and labels.
    pub fn forward(&self, batch: &InputBatch) -> Result<ForwardOutput> {
        let logits = self.decoder.forward(&batch.input_ids, None)?;
        let Some(target_labels) = &batch.target_labels else {
            return Ok(ForwardOutput {
                loss: 0.0,
                logits,
                per_token_loss: None,
                summaries: Summaries::new(),
            });
        };
        if target_labels.dims() != batch.input_ids.dims() {
            bail!(
                "target_labels shape {:?} does not match input_ids shape {:?}",
                target_labels.dims(),
                batch.input_ids.dims()
            );
        }
        let metrics = self.metrics(&logits, target_labels, batch.target_num_bytes.as_ref())?;
        Ok(ForwardOutput {
            loss: metrics.loss,
            logits,
            per_token_loss: Some(metrics.per_token_loss),
            summaries: metrics.summaries,
        })
    }

    /// Logits only, no loss computation
    pub fn predict(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.decoder.forward(input_ids, None)
    }

    /// Metrics over precomputed logits
    pub fn metrics(
        &self,
        logits: &Tensor,
        target_labels: &Tensor,
        target_num_bytes: Option<&Tensor>,
    ) -> Result<MetricsOutput> {
        compute_metrics(logits, target_labels, target_num_bytes, self.pad_token_id)
    }

    /// Fail if any parameter contains a NaN or infinity
    pub fn check_numerics(&self) -> Result<()> {
        for (name, tensor) in self.decoder.named_parameters() {
            let stats = crate::debug::tensor_stats(&tensor)?;
            if stats.num_nan > 0 || stats.num_inf > 0 {
                bail!(
                    "parameter {name} has {} NaN and {} Inf values",
                    stats.num_nan,
                    stats.num_inf
                );
            }
        }
        Ok(())
    }

    /// The underlying decoder
    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Pad token id used for target masking
    pub fn pad_token_id(&self) -> i64 {
        self.pad_token_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use candle_core::DType;

    fn tiny() -> CausalLm {
        let config = ModelConfig {
            decoder: DecoderConfig::gpt2(1, 10, 2, 10, 10),
        };
        CausalLm::new_random(&config, &Initializer::gpt2(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_without_labels() {
        let model = tiny();
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let out = model.forward(&InputBatch::new(ids)).unwrap();
        assert_eq!(out.loss, 0.0);
        assert!(out.summaries.is_empty());
        assert_eq!(out.logits.dims3().unwrap(), (1, 3, 10));
    }

    #[test]
    fn test_forward_with_labels_produces_summaries() {
        let model = tiny();
        let batch = InputBatch {
            input_ids: Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap(),
            target_labels: Some(Tensor::new(&[[2i64, 3, 4, 5]], &Device::Cpu).unwrap()),
            target_num_bytes: None,
        };
        let out = model.forward(&batch).unwrap();
        assert!(out.loss > 0.0);
        assert_eq!(out.summaries["loss"].weight, 4.0);
        assert!(out.summaries.contains_key("perplexity"));
        assert!(!out.summaries.contains_key("bits_per_byte"));
    }

    #[test]
    fn test_forward_rejects_shape_mismatch() {
        let model = tiny();
        let batch = InputBatch {
            input_ids: Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap(),
            target_labels: Some(Tensor::new(&[[2i64, 3]], &Device::Cpu).unwrap()),
            target_num_bytes: None,
        };
        assert!(model.forward(&batch).is_err());
    }

    #[test]
    fn test_check_numerics_passes_on_random_init() {
        let model = tiny();
        model.check_numerics().unwrap();
    }

    #[test]
    fn test_check_numerics_catches_nan() {
        let model = tiny();
        let mut tensors: HashMap<String, Tensor> =
            model.decoder().named_parameters().into_iter().collect();
        let dims = tensors["ln_f.bias"].dims().to_vec();
        tensors.insert(
            "ln_f.bias".to_string(),
            (Tensor::zeros(dims, DType::F32, &Device::Cpu).unwrap() * f64::NAN).unwrap(),
        );
        let config = ModelConfig {
            decoder: model.decoder().config().clone(),
        };
        let broken = CausalLm::from_tensors(&config, &tensors, &Device::Cpu).unwrap();
        assert!(broken.check_numerics().is_err());
    }
}
