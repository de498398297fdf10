//! Model components
//!
//! - GPT-2 style causal decoder with KV-cache incremental decoding
//! - Loss/metrics wrapper ([`CausalLm`])
//! - Sampling-based generation

pub mod causal_lm;
pub mod decoder;
pub mod generation;
pub mod kv_cache;

pub use causal_lm::{CausalLm, ForwardOutput, InputBatch};
pub use decoder::{parameter_names, Decoder};
pub use generation::{generate, GenerationConfig, Sampler};
pub use kv_cache::{KvCache, LayerKvCache};
