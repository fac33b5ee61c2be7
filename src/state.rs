//! Per-session activation buffers.

use crate::attention::RotaryEmbedding;
use crate::config::ModelConfig;
use crate::kv_cache::KvCache;
use crate::numeric::{try_zeroed, Scalar};
use crate::Result;

/// Scratch state for one decoding step plus the KV cache carried between steps.
///
/// Sized from the loaded model's dimensions and never shared across sessions.
#[derive(Debug, Clone)]
pub struct RunState<T> {
    /// Current activation (dim).
    pub x: Vec<T>,
    /// Normalized activation / attention output (dim).
    pub xb: Vec<T>,
    /// Residual branch scratch (dim).
    pub xb2: Vec<T>,
    /// Feed-forward gate (hidden_dim).
    pub hb: Vec<T>,
    /// Feed-forward up projection (hidden_dim).
    pub hb2: Vec<T>,
    /// Query (dim).
    pub q: Vec<T>,
    /// Key for the current position (kv_dim).
    pub k: Vec<T>,
    /// Value for the current position (kv_dim).
    pub v: Vec<T>,
    /// Attention scores (n_heads x seq_len).
    pub att: Vec<T>,
    /// Output logits (vocab_size).
    pub logits: Vec<T>,
    /// Rotary frequency table.
    pub rope: RotaryEmbedding<T>,
    /// Key/value cache.
    pub cache: KvCache<T>,
}

impl<T: Scalar> RunState<T> {
    /// Allocate zeroed buffers for a model.
    pub fn new(config: &ModelConfig, rope_theta: f32) -> Result<Self> {
        let dim = config.dim;
        let kv_dim = config.kv_dim();
        Ok(Self {
            x: try_zeroed(dim)?,
            xb: try_zeroed(dim)?,
            xb2: try_zeroed(dim)?,
            hb: try_zeroed(config.hidden_dim)?,
            hb2: try_zeroed(config.hidden_dim)?,
            q: try_zeroed(dim)?,
            k: try_zeroed(kv_dim)?,
            v: try_zeroed(kv_dim)?,
            att: try_zeroed(config.n_heads.saturating_mul(config.seq_len))?,
            logits: try_zeroed(config.vocab_size)?,
            rope: RotaryEmbedding::new(config, rope_theta)?,
            cache: KvCache::for_model(config)?,
        })
    }

    /// Bytes held by activations and cache.
    pub fn memory_bytes(&self) -> usize {
        let elems = self.x.len()
            + self.xb.len()
            + self.xb2.len()
            + self.hb.len()
            + self.hb2.len()
            + self.q.len()
            + self.k.len()
            + self.v.len()
            + self.att.len()
            + self.logits.len();
        elems * std::mem::size_of::<T>() + self.cache.memory_bytes()
    }

    /// Clear the cache for a fresh sequence.
    pub fn reset(&mut self) {
        self.cache.reset();
    }
}
