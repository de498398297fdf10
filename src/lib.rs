//! # causal-lm
//!
//! A GPT-2 style causal language model with its training-time metrics
//! layer, built on Candle.
//!
//! ## Features
//!
//! - Causal transformer decoder with tied embedding / LM head weights
//! - Masked cross-entropy loss over live targets
//! - Streaming accuracy / loss / perplexity / bits-per-byte accumulation
//! - Hugging Face GPT-2 checkpoint import
//! - KV-cache incremental decoding with top-k / top-p sampling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use causal_lm::{CausalLm, DecoderConfig, Initializer, InputBatch, ModelConfig};
//! use candle_core::Device;
//!
//! let config = ModelConfig { decoder: DecoderConfig::gpt2(12, 768, 12, 50257, 1024) };
//! let model = CausalLm::new_random(&config, &Initializer::gpt2(), &Device::Cpu)?;
//! let output = model.forward(&batch)?;
//! println!("loss = {}", output.loss);
//! ```

// Allow dead code for infrastructure that may be used in the future
#![allow(dead_code)]
// Require docs for public items, but not struct fields (too verbose)
#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod convert;
pub mod debug;
pub mod init;
pub mod loss;
pub mod metrics;
pub mod models;

// Re-exports for convenience
pub use config::{Activation, DecoderConfig, ModelConfig};
pub use init::{Initializer, WeightInitializer};
pub use loss::cross_entropy;
pub use metrics::{compute_metrics, MetricAccumulator, Summaries, WeightedScalar};
pub use models::{generate, CausalLm, Decoder, GenerationConfig, InputBatch};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
