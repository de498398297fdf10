//! Masked cross-entropy loss
//!
//! Per-token negative log-likelihood with a live-target mask. Positions
//! whose mask is zero contribute nothing to the loss; the scalar loss is
//! normalized by the number of live targets.

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Outputs of [`cross_entropy`]
#[derive(Debug, Clone)]
pub struct CrossEntropyOutput {
    /// Mean negative log-likelihood over live targets
    pub loss: f32,
    /// Per-token loss after masking (zero at dead positions)
    pub per_token_loss: Tensor,
    /// Per-token loss before masking
    pub pre_mask_loss: Tensor,
    /// Number of live targets
    pub num_targets: f32,
}

/// Cross-entropy of `target_labels` under `logits`
///
/// `logits` has shape (..., vocab), `target_labels` (i64) and
/// `live_targets` (f32, 1 = live) the matching leading shape. Labels at
/// dead positions may be negative; they are clamped before the gather and
/// masked out of every output that matters.
pub fn cross_entropy(
    logits: &Tensor,
    target_labels: &Tensor,
    live_targets: &Tensor,
) -> Result<CrossEntropyOutput> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let labels = target_labels.to_dtype(DType::I64)?;
    let safe_labels = labels.maximum(&labels.zeros_like()?)?;
    let pre_mask_loss = log_probs
        .gather(&safe_labels.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()?;

    let per_token_loss = (&pre_mask_loss * live_targets)?;
    let num_targets = live_targets.sum_all()?.to_scalar::<f32>()?;
    let loss = per_token_loss.sum_all()?.to_scalar::<f32>()? / num_targets.max(1.0);

    Ok(CrossEntropyOutput {
        loss,
        per_token_loss,
        pre_mask_loss,
        num_targets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 8), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[1i64, 5, 7]], &device).unwrap();
        let mask = Tensor::ones((1, 3), DType::F32, &device).unwrap();
        let out = cross_entropy(&logits, &labels, &mask).unwrap();
        assert!((out.loss - (8f32).ln()).abs() < 1e-6);
        assert_eq!(out.num_targets, 3.0);
    }

    #[test]
    fn test_masked_positions_ignored() {
        let device = Device::Cpu;
        // Position 1 has a confident wrong prediction but is masked out.
        let logits = Tensor::new(
            &[[[10.0f32, 0.0, 0.0], [0.0, 0.0, 100.0], [0.0, 10.0, 0.0]]],
            &device,
        )
        .unwrap();
        let labels = Tensor::new(&[[0i64, 0, 1]], &device).unwrap();
        let mask = Tensor::new(&[[1.0f32, 0.0, 1.0]], &device).unwrap();
        let out = cross_entropy(&logits, &labels, &mask).unwrap();
        assert_eq!(out.num_targets, 2.0);
        assert!(out.loss < 1e-3, "loss was {}", out.loss);
        let masked: Vec<f32> = out
            .per_token_loss
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(masked[1], 0.0);
    }

    #[test]
    fn test_negative_labels_safe_when_masked() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[-1i64, 2]], &device).unwrap();
        let mask = Tensor::new(&[[0.0f32, 1.0]], &device).unwrap();
        let out = cross_entropy(&logits, &labels, &mask).unwrap();
        assert!((out.loss - (4f32).ln()).abs() < 1e-6);
    }

    #[test]
    fn test_all_masked_loss_is_zero() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[0i64, 0]], &device).unwrap();
        let mask = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        let out = cross_entropy(&logits, &labels, &mask).unwrap();
        assert_eq!(out.loss, 0.0);
        assert_eq!(out.num_targets, 0.0);
    }
}
