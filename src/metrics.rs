//! Training-time metrics and streaming accumulation
//!
//! Computes loss, accuracy, perplexity, and bits-per-byte summaries from
//! logits and target labels, plus a weighted-mean accumulator so metrics
//! can be streamed across batches. A batch with no live targets carries
//! zero weight and leaves accumulated values untouched.

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use std::collections::BTreeMap;

use crate::loss::cross_entropy;

/// A mean together with the weight it was computed over
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedScalar {
    /// The mean value
    pub mean: f32,
    /// Weight (typically a token or byte count)
    pub weight: f32,
}

impl WeightedScalar {
    /// Construct from mean and weight
    pub fn new(mean: f32, weight: f32) -> Self {
        Self { mean, weight }
    }

    /// Fold another weighted mean into this one
    pub fn accumulate(&mut self, other: WeightedScalar) {
        let total = self.weight + other.weight;
        if total > 0.0 {
            self.mean = (self.mean * self.weight + other.mean * other.weight) / total;
        }
        self.weight = total;
    }
}

/// Named metric summaries, ordered by name
pub type Summaries = BTreeMap<String, WeightedScalar>;

/// Streaming accumulator over per-batch summaries
///
/// Each update folds a batch's weighted means into the running totals.
/// Zero-weight entries are no-ops, so dummy batches never shift a metric.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    summaries: Summaries,
}

impl MetricAccumulator {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch of summaries into the running state
    pub fn update(&mut self, batch: &Summaries) {
        for (name, value) in batch {
            self.summaries
                .entry(name.clone())
                .or_insert_with(|| WeightedScalar::new(0.0, 0.0))
                .accumulate(*value);
        }
    }

    /// Accumulated summaries so far
    pub fn summaries(&self) -> &Summaries {
        &self.summaries
    }
}

/// Outputs of [`compute_metrics`]
#[derive(Debug, Clone)]
pub struct MetricsOutput {
    /// Mean loss over live targets
    pub loss: f32,
    /// Per-token loss after masking
    pub per_token_loss: Tensor,
    /// Number of live targets
    pub num_targets: f32,
    /// All summaries, ready for a [`MetricAccumulator`]
    pub summaries: Summaries,
}

/// Compute loss, accuracy, perplexity, and (optionally) bits-per-byte
///
/// A target is live when its label differs from `pad_token_id` and is
/// non-negative. `target_num_bytes` holds per-example raw byte counts;
/// when present, bits-per-byte normalizes the summed per-token loss by
/// bytes instead of tokens.
pub fn compute_metrics(
    logits: &Tensor,
    target_labels: &Tensor,
    target_num_bytes: Option<&Tensor>,
    pad_token_id: i64,
) -> Result<MetricsOutput> {
    let labels = target_labels.to_dtype(DType::I64)?;
    let live_targets = (labels.ne(pad_token_id)? * labels.ge(0i64)?)?.to_dtype(DType::F32)?;

    let ce = cross_entropy(logits, &labels, &live_targets)?;
    let num_targets = ce.num_targets;

    let predictions = logits.argmax(D::Minus1)?.to_dtype(DType::I64)?;
    let correct = (predictions.eq(&labels)?.to_dtype(DType::F32)? * &live_targets)?;
    let accuracy = correct.sum_all()?.to_scalar::<f32>()? / num_targets.max(1.0);

    let mut summaries = Summaries::new();
    summaries.insert("loss".to_string(), WeightedScalar::new(ce.loss, num_targets));
    summaries.insert(
        "accuracy".to_string(),
        WeightedScalar::new(accuracy, num_targets),
    );
    summaries.insert(
        "perplexity".to_string(),
        WeightedScalar::new(ce.loss.exp(), num_targets),
    );

    if let Some(num_bytes) = target_num_bytes {
        let total_bytes = num_bytes
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        let total_loss = ce.per_token_loss.sum_all()?.to_scalar::<f32>()?;
        let bits_per_byte = total_loss / total_bytes.max(1.0) / std::f32::consts::LN_2;
        summaries.insert(
            "bits_per_byte".to_string(),
            WeightedScalar::new(bits_per_byte, total_bytes),
        );
    }

    Ok(MetricsOutput {
        loss: ce.loss,
        per_token_loss: ce.per_token_loss,
        num_targets,
        summaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_weighted_scalar_accumulate() {
        let mut a = WeightedScalar::new(1.0, 2.0);
        a.accumulate(WeightedScalar::new(4.0, 4.0));
        assert!((a.mean - 3.0).abs() < 1e-6);
        assert_eq!(a.weight, 6.0);
    }

    #[test]
    fn test_zero_weight_update_is_noop() {
        let mut a = WeightedScalar::new(2.5, 10.0);
        a.accumulate(WeightedScalar::new(99.0, 0.0));
        assert_eq!(a.mean, 2.5);
        assert_eq!(a.weight, 10.0);
    }

    #[test]
    fn test_accumulator_tracks_names() {
        let mut acc = MetricAccumulator::new();
        let mut batch = Summaries::new();
        batch.insert("loss".to_string(), WeightedScalar::new(2.0, 5.0));
        acc.update(&batch);
        batch.insert("loss".to_string(), WeightedScalar::new(4.0, 5.0));
        acc.update(&batch);
        let loss = acc.summaries()["loss"];
        assert!((loss.mean - 3.0).abs() < 1e-6);
        assert_eq!(loss.weight, 10.0);
    }

    #[test]
    fn test_pad_and_negative_labels_dead() {
        let device = Device::Cpu;
        // Perfect predictions everywhere; only position 0 is live.
        let logits = Tensor::new(
            &[[[0.0f32, 9.0, 0.0], [9.0, 0.0, 0.0], [0.0, 9.0, 0.0]]],
            &device,
        )
        .unwrap();
        let labels = Tensor::new(&[[1i64, 0, -1]], &device).unwrap();
        let out = compute_metrics(&logits, &labels, None, 0).unwrap();
        assert_eq!(out.num_targets, 1.0);
        assert_eq!(out.summaries["accuracy"].mean, 1.0);
        assert_eq!(out.summaries["accuracy"].weight, 1.0);
    }

    #[test]
    fn test_perplexity_is_exp_loss() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3, 5), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[1i64, 2, 3], [4, 1, 2]], &device).unwrap();
        let out = compute_metrics(&logits, &labels, None, 0).unwrap();
        let loss = out.summaries["loss"].mean;
        assert!((out.summaries["perplexity"].mean - loss.exp()).abs() < 1e-5);
        assert_eq!(out.summaries["loss"].weight, 6.0);
    }

    #[test]
    fn test_bits_per_byte_weighting() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[1i64, 2]], &device).unwrap();
        let num_bytes = Tensor::new(&[8i64], &device).unwrap();
        let out = compute_metrics(&logits, &labels, Some(&num_bytes), 0).unwrap();
        let bpb = out.summaries["bits_per_byte"];
        let expected = 2.0 * (4f32).ln() / 8.0 / std::f32::consts::LN_2;
        assert!((bpb.mean - expected).abs() < 1e-6);
        assert_eq!(bpb.weight, 8.0);
    }
}
