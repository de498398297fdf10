//! Model configuration
//!
//! Hyperparameters for the GPT-2 style decoder, loadable from a YAML file.

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Activation function used in the decoder MLP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Gaussian error linear unit (erf formulation)
    #[default]
    Gelu,
    /// Rectified linear unit
    Relu,
}

impl Activation {
    /// Apply the activation to a tensor
    pub fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Gelu => x.gelu_erf(),
            Activation::Relu => x.relu(),
        }
    }
}

/// Decoder hyperparameters
///
/// Matches the GPT-2 family: learned positional embeddings, pre-norm
/// transformer blocks, tied embedding / LM head weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Number of transformer layers
    pub num_layers: usize,
    /// Model (embedding) dimension
    pub hidden_dim: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length (size of the position embedding table)
    pub max_position_embeddings: usize,
    /// Layer norm epsilon
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    /// Dropout rate. Stored for checkpoint compatibility; the inference
    /// path never applies dropout.
    #[serde(default)]
    pub dropout_rate: f32,
    /// MLP activation function
    #[serde(default)]
    pub activation: Activation,
    /// Token id treated as padding when masking targets
    #[serde(default)]
    pub pad_token_id: i64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl DecoderConfig {
    /// GPT-2 style decoder config with standard defaults
    pub fn gpt2(
        num_layers: usize,
        hidden_dim: usize,
        num_heads: usize,
        vocab_size: usize,
        max_position_embeddings: usize,
    ) -> Self {
        Self {
            num_layers,
            hidden_dim,
            num_heads,
            vocab_size,
            max_position_embeddings,
            layer_norm_epsilon: default_layer_norm_epsilon(),
            dropout_rate: 0.0,
            activation: Activation::Gelu,
            pad_token_id: 0,
        }
    }

    /// Per-head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 || self.hidden_dim == 0 || self.num_heads == 0 {
            bail!("decoder config has a zero-sized field: {:?}", self);
        }
        if self.vocab_size == 0 || self.max_position_embeddings == 0 {
            bail!("decoder config has a zero-sized field: {:?}", self);
        }
        if self.hidden_dim % self.num_heads != 0 {
            bail!(
                "hidden_dim {} is not divisible by num_heads {}",
                self.hidden_dim,
                self.num_heads
            );
        }
        if !(0.0..=1.0).contains(&self.dropout_rate) {
            bail!("dropout_rate {} is out of range", self.dropout_rate);
        }
        Ok(())
    }
}

/// Top-level model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Decoder hyperparameters
    pub decoder: DecoderConfig,
}

impl ModelConfig {
    /// Load from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        config.decoder.validate()?;
        Ok(config)
    }

    /// Save to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write config: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_gpt2_config_defaults() {
        let cfg = DecoderConfig::gpt2(2, 16, 4, 24, 11);
        assert_eq!(cfg.num_layers, 2);
        assert_eq!(cfg.head_dim(), 4);
        assert_eq!(cfg.layer_norm_epsilon, 1e-5);
        assert_eq!(cfg.pad_token_id, 0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let cfg = DecoderConfig::gpt2(2, 10, 3, 24, 11);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_layers() {
        let cfg = DecoderConfig::gpt2(0, 16, 4, 24, 11);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let cfg = ModelConfig {
            decoder: DecoderConfig::gpt2(1, 10, 2, 10, 10),
        };
        let text = serde_yaml::to_string(&cfg).unwrap();
        let parsed: ModelConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.decoder.hidden_dim, 10);
        assert_eq!(parsed.decoder.activation, Activation::Gelu);
    }

    #[test]
    fn test_activation_relu() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[-1.0f32, 2.0]], &device).unwrap();
        let y = Activation::Relu.apply(&x).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![0.0, 2.0]]);
    }
}
