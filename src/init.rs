//! Parameter initialization
//!
//! Random initializers for decoder weights. The default scheme matches the
//! GPT-2 recipe: normal(0, 0.02) weights, zero biases, unit layer-norm
//! gains. Individual parameters can be overridden by name suffix.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};

/// Sampling distribution for weight initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Normal with mean zero
    Normal,
    /// Uniform over [-scale, scale]
    Uniform,
}

/// Which dimension the scale is normalized by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    /// Input dimension (last axis)
    FanIn,
    /// Output dimension (first axis)
    FanOut,
    /// Average of input and output dimensions
    FanAvg,
}

/// Initializer for a single weight tensor
#[derive(Debug, Clone, Copy)]
pub struct WeightInitializer {
    /// Base scale. With `fan` set, the effective std is scale / sqrt(fan).
    pub scale: f64,
    /// Sampling distribution
    pub distribution: Distribution,
    /// Optional fan normalization
    pub fan: Option<FanMode>,
}

impl WeightInitializer {
    /// Plain normal with a fixed standard deviation
    pub fn normal(scale: f64) -> Self {
        Self {
            scale,
            distribution: Distribution::Normal,
            fan: None,
        }
    }

    /// Uniform over [-scale, scale]
    pub fn uniform(scale: f64) -> Self {
        Self {
            scale,
            distribution: Distribution::Uniform,
            fan: None,
        }
    }

    /// Normalize the scale by the given fan mode
    pub fn with_fan(mut self, fan: FanMode) -> Self {
        self.fan = Some(fan);
        self
    }

    fn effective_scale(&self, shape: &[usize]) -> Result<f64> {
        let Some(fan) = self.fan else {
            return Ok(self.scale);
        };
        if shape.len() < 2 {
            bail!("fan normalization needs a rank >= 2 shape, got {:?}", shape);
        }
        let fan_out = shape[0] as f64;
        let fan_in = shape[shape.len() - 1] as f64;
        let denom = match fan {
            FanMode::FanIn => fan_in,
            FanMode::FanOut => fan_out,
            FanMode::FanAvg => 0.5 * (fan_in + fan_out),
        };
        Ok(self.scale / denom.sqrt())
    }

    /// Sample a tensor of the given shape
    pub fn sample(&self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let scale = self.effective_scale(shape)? as f32;
        let t = match self.distribution {
            Distribution::Normal => Tensor::randn(0.0f32, scale, shape, device)?,
            Distribution::Uniform => Tensor::rand(-scale, scale, shape, device)?,
        };
        Ok(t)
    }
}

/// Named-parameter initializer for a whole model
///
/// A default rule covers every weight; overrides are matched by parameter
/// name suffix, first match wins. Biases are zeros and layer-norm gains are
/// ones regardless of the rules.
#[derive(Debug, Clone)]
pub struct Initializer {
    default: WeightInitializer,
    overrides: Vec<(String, WeightInitializer)>,
}

impl Initializer {
    /// GPT-2 default scheme: all weights normal(0, 0.02)
    pub fn gpt2() -> Self {
        Self {
            default: WeightInitializer::normal(0.02),
            overrides: Vec::new(),
        }
    }

    /// Set the default weight initializer
    pub fn with_default(mut self, init: WeightInitializer) -> Self {
        self.default = init;
        self
    }

    /// Add a suffix-matched override
    pub fn with_override(mut self, suffix: &str, init: WeightInitializer) -> Self {
        self.overrides.push((suffix.to_string(), init));
        self
    }

    fn rule_for(&self, name: &str) -> &WeightInitializer {
        self.overrides
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, init)| init)
            .unwrap_or(&self.default)
    }

    /// Initialize a weight by parameter name
    pub fn weight(&self, name: &str, shape: &[usize], device: &Device) -> Result<Tensor> {
        self.rule_for(name).sample(shape, device)
    }

    /// Zero bias
    pub fn bias(&self, len: usize, device: &Device) -> Result<Tensor> {
        Ok(Tensor::zeros((len,), DType::F32, device)?)
    }

    /// Unit layer-norm gain
    pub fn ln_gain(&self, len: usize, device: &Device) -> Result<Tensor> {
        Ok(Tensor::ones((len,), DType::F32, device)?)
    }
}

impl Default for Initializer {
    fn default() -> Self {
        Self::gpt2()
    }
}
