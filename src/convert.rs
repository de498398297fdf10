//! Reference checkpoint import
//!
//! Loads Hugging Face GPT-2 safetensors weights into the decoder. HF
//! stores its projection weights in Conv1D layout (in, out); Linear layers
//! expect (out, in), so `c_attn`, `c_proj`, and `c_fc` are transposed on
//! the way in. Tensor names may carry a `transformer.` prefix depending on
//! how the checkpoint was exported; it is stripped here.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

use crate::config::DecoderConfig;
use crate::models::decoder::{parameter_names, Decoder};

/// Report of how checkpoint tensors mapped onto the decoder
#[derive(Debug, Clone)]
pub struct ImportReport {
    /// Names the decoder needed but the file did not provide
    pub missing: Vec<String>,
    /// Names present in the file but unused by the decoder
    pub unused: Vec<String>,
}

impl ImportReport {
    /// True when every needed tensor was found
    pub fn complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Weight names stored transposed (Conv1D layout) in HF GPT-2 checkpoints
fn is_conv1d_weight(name: &str) -> bool {
    name.ends_with("attn.c_attn.weight")
        || name.ends_with("attn.c_proj.weight")
        || name.ends_with("mlp.c_fc.weight")
        || name.ends_with("mlp.c_proj.weight")
}

/// Normalize one HF tensor name to the decoder's canonical name
fn canonical_name(name: &str) -> &str {
    name.strip_prefix("transformer.").unwrap_or(name)
}

/// Remap a raw HF GPT-2 tensor map into the decoder's canonical layout
pub fn remap_gpt2_tensors(raw: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let mut mapped = HashMap::with_capacity(raw.len());
    for (name, tensor) in raw {
        let canonical = canonical_name(&name).to_string();
        // lm_head is tied to wte in GPT-2; skip a redundant copy.
        if canonical == "lm_head.weight" {
            continue;
        }
        let tensor = if is_conv1d_weight(&canonical) {
            tensor.t()?.contiguous()?
        } else {
            tensor
        };
        mapped.insert(canonical, tensor);
    }
    Ok(mapped)
}

/// Load a HF GPT-2 safetensors checkpoint into a decoder
///
/// Returns the decoder plus a report of missing/unused tensor names.
/// Loading fails when any needed tensor is absent; unused tensors (for
/// example attention bias buffers) are only logged.
pub fn load_gpt2_checkpoint<P: AsRef<Path>>(
    path: P,
    config: &DecoderConfig,
    device: &Device,
) -> Result<(Decoder, ImportReport)> {
    let path = path.as_ref();
    let raw = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load checkpoint: {:?}", path))?;
    debug!("loaded {} tensors from {:?}", raw.len(), path);

    let mapped = remap_gpt2_tensors(raw)?;

    let needed: HashSet<String> = parameter_names(config).into_iter().collect();
    let missing: Vec<String> = {
        let mut v: Vec<String> = needed
            .iter()
            .filter(|n| !mapped.contains_key(*n))
            .cloned()
            .collect();
        v.sort();
        v
    };
    let unused: Vec<String> = {
        let mut v: Vec<String> = mapped
            .keys()
            .filter(|n| !needed.contains(*n))
            .cloned()
            .collect();
        v.sort();
        v
    };
    for name in &unused {
        debug!("checkpoint tensor unused by decoder: {name}");
    }
    if !missing.is_empty() {
        warn!(
            "checkpoint {:?} is missing {} of {} decoder tensors",
            path,
            missing.len(),
            needed.len()
        );
    }

    let decoder = Decoder::from_tensors(config.clone(), &mapped, device)?;
    Ok((decoder, ImportReport { missing, unused }))
}
