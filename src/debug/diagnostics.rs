//! Parameter diagnostics
//!
//! Summary statistics over parameter tensors, used by the `info` command
//! and by numeric checking. A freshly initialized model should show small
//! means, stds near the initializer scale, and zero NaN/Inf counts.

use anyhow::Result;
use candle_core::Tensor;

/// Summary statistics for one tensor
#[derive(Debug, Clone, Copy)]
pub struct TensorStats {
    /// Element count
    pub count: usize,
    /// Minimum finite value
    pub min: f32,
    /// Maximum finite value
    pub max: f32,
    /// Mean over finite values
    pub mean: f32,
    /// Standard deviation over finite values
    pub std: f32,
    /// Number of NaN elements
    pub num_nan: usize,
    /// Number of infinite elements
    pub num_inf: usize,
}

/// Compute summary statistics for a tensor
pub fn tensor_stats(tensor: &Tensor) -> Result<TensorStats> {
    let values: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f64;
    let mut num_nan = 0;
    let mut num_inf = 0;
    let mut finite = 0usize;

    for &v in &values {
        if v.is_nan() {
            num_nan += 1;
        } else if v.is_infinite() {
            num_inf += 1;
        } else {
            min = min.min(v);
            max = max.max(v);
            sum += v as f64;
            finite += 1;
        }
    }

    let mean = if finite > 0 {
        (sum / finite as f64) as f32
    } else {
        0.0
    };
    let var: f64 = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| {
            let d = v as f64 - mean as f64;
            d * d
        })
        .sum::<f64>()
        / finite.max(1) as f64;

    Ok(TensorStats {
        count: values.len(),
        min: if finite > 0 { min } else { 0.0 },
        max: if finite > 0 { max } else { 0.0 },
        mean,
        std: var.sqrt() as f32,
        num_nan,
        num_inf,
    })
}

impl TensorStats {
    /// True when every element is finite
    pub fn all_finite(&self) -> bool {
        self.num_nan == 0 && self.num_inf == 0
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let mut line = format!(
            "n={} mean={:.4} std={:.4} min={:.4} max={:.4}",
            self.count, self.mean, self.std, self.min, self.max
        );
        if !self.all_finite() {
            line.push_str(&format!(" nan={} inf={}", self.num_nan, self.num_inf));
        }
        line
    }
}
