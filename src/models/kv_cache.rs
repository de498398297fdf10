//! KV cache for incremental decoding
//!
//! Keys and values are appended along the sequence axis so that each
//! generation step only computes attention for the new token.

use anyhow::{bail, Result};
use candle_core::Tensor;

/// Cache for a single decoder layer
///
/// Tensors are shaped (batch, heads, seq, head_dim).
#[derive(Debug, Clone, Default)]
pub struct LayerKvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
    max_len: usize,
}

impl LayerKvCache {
    /// Create an empty cache bounded at `max_len` positions
    pub fn new(max_len: usize) -> Self {
        Self {
            k: None,
            v: None,
            max_len,
        }
    }

    /// Append new keys/values, returning the full cached tensors
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match (&self.k, &self.v) {
            (Some(pk), Some(pv)) => (Tensor::cat(&[pk, k], 2)?, Tensor::cat(&[pv, v], 2)?),
            _ => (k.clone(), v.clone()),
        };
        if k.dim(2)? > self.max_len {
            bail!(
                "kv cache overflow: {} positions, max {}",
                k.dim(2)?,
                self.max_len
            );
        }
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }

    /// Number of cached positions
    pub fn len(&self) -> usize {
        self.k.as_ref().and_then(|k| k.dim(2).ok()).unwrap_or(0)
    }

    /// True if nothing has been cached yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all cached positions
    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// Per-layer caches for a full decoder
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    /// One cache per decoder layer
    pub layers: Vec<LayerKvCache>,
}

impl KvCache {
    /// Create caches for `num_layers` layers, each bounded at `max_len`
    pub fn new(num_layers: usize, max_len: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerKvCache::new(max_len)).collect(),
        }
    }

    /// Number of positions cached so far (all layers stay in sync)
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.len()).unwrap_or(0)
    }

    /// Drop all cached positions
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn kv(seq: usize) -> Tensor {
        Tensor::zeros((1, 2, seq, 4), candle_core::DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_append_grows_seq() {
        let mut cache = LayerKvCache::new(16);
        let (k, _) = cache.append(&kv(3), &kv(3)).unwrap();
        assert_eq!(k.dim(2).unwrap(), 3);
        let (k, v) = cache.append(&kv(1), &kv(1)).unwrap();
        assert_eq!(k.dim(2).unwrap(), 4);
        assert_eq!(v.dim(2).unwrap(), 4);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_overflow_rejected() {
        let mut cache = LayerKvCache::new(2);
        assert!(cache.append(&kv(3), &kv(3)).is_err());
    }

    #[test]
    fn test_reset() {
        let mut cache = KvCache::new(2, 8);
        cache.layers[0].append(&kv(2), &kv(2)).unwrap();
        cache.layers[1].append(&kv(2), &kv(2)).unwrap();
        assert_eq!(cache.seq_len(), 2);
        cache.reset();
        assert_eq!(cache.seq_len(), 0);
    }
}
