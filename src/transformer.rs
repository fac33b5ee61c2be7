//! Forward engine: one decoding step from `(token, pos)` to logits.
//!
//! # Key Concepts
//!
//! Each layer applies, in order:
//!
//! ```text
//! xb  = rmsnorm(x, rms_att[l])
//! q,k,v = wq[l] @ xb, wk[l] @ xb, wv[l] @ xb
//! rotate q, k by pos;  cache[l][pos] = (k, v)
//! x  += wo[l] @ attention(q, cache[l][0..=pos])
//! xb  = rmsnorm(x, rms_ffn[l])
//! x  += w2[l] @ (silu(w1[l] @ xb) * (w3[l] @ xb))
//! ```
//!
//! followed by a final rmsnorm and the classifier projection. The KV cache
//! is the only state carried between calls.

use crate::attention::{attend, AttentionConfig};
use crate::config::ModelConfig;
use crate::numeric::Scalar;
use crate::ops::{accumulate, matmul, rmsnorm, rmsnorm_in_place, silu};
use crate::state::RunState;
use crate::weights::TransformerWeights;
use crate::{Error, Result};

/// Loaded weights plus the session's run state.
#[derive(Debug, Clone)]
pub struct Transformer<T> {
    weights: TransformerWeights<T>,
    state: RunState<T>,
    attention: AttentionConfig,
}

impl<T: Scalar> Transformer<T> {
    /// Allocate run state for loaded weights.
    pub fn new(weights: TransformerWeights<T>, rope_theta: f32) -> Result<Self> {
        let config = *weights.config();
        let state = RunState::new(&config, rope_theta)?;
        Ok(Self {
            weights,
            state,
            attention: AttentionConfig::from_model(&config),
        })
    }

    /// Model dimensions.
    pub const fn config(&self) -> &ModelConfig {
        self.weights.config()
    }

    /// Loaded weights.
    pub const fn weights(&self) -> &TransformerWeights<T> {
        &self.weights
    }

    /// Logits from the most recent step.
    pub fn logits(&self) -> &[T] {
        &self.state.logits
    }

    /// Positions held in the KV cache.
    pub const fn cached_positions(&self) -> usize {
        self.state.cache.len()
    }

    /// Bytes held by weights, activations and cache.
    pub fn memory_bytes(&self) -> usize {
        self.weights.memory_bytes() + self.state.memory_bytes()
    }

    /// Start a fresh sequence.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Run one decoding step and return logits over the vocabulary.
    ///
    /// Requires `pos < seq_len` and `token < vocab_size`; positions
    /// `0..pos` must already have been processed for the result to be
    /// meaningful.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use llama_engine::config::ModelConfig;
    /// use llama_engine::transformer::Transformer;
    /// use llama_engine::weights::TransformerWeights;
    ///
    /// let config = ModelConfig::new(8, 16, 1, 2, 12, 4);
    /// let weights = TransformerWeights::<f32>::synthetic(&config, 0).unwrap();
    /// let mut model = Transformer::new(weights, 10_000.0).unwrap();
    ///
    /// assert_eq!(model.forward(1, 0).unwrap().len(), 12);
    /// assert!(model.forward(1, 4).is_err());
    /// ```
    pub fn forward(&mut self, token: u32, pos: usize) -> Result<&[T]> {
        let c = *self.weights.config();
        if pos >= c.seq_len {
            return Err(Error::out_of_bounds(format!(
                "position {pos} >= seq_len {}",
                c.seq_len
            )));
        }

        let dim = c.dim;
        let kv_dim = c.kv_dim();
        let hidden = c.hidden_dim;
        let w = &self.weights;
        let s = &mut self.state;

        s.x.copy_from_slice(w.embedding(token as usize)?);

        for l in 0..c.n_layers {
            rmsnorm(&mut s.xb, &s.x, &w.rms_att[l * dim..(l + 1) * dim]);

            matmul(&mut s.q, &s.xb, &w.wq[l * dim * dim..(l + 1) * dim * dim]);
            matmul(&mut s.k, &s.xb, &w.wk[l * kv_dim * dim..(l + 1) * kv_dim * dim]);
            matmul(&mut s.v, &s.xb, &w.wv[l * kv_dim * dim..(l + 1) * kv_dim * dim]);

            s.rope.apply(&mut s.q, &mut s.k, pos)?;
            s.cache.store(l, pos, &s.k, &s.v)?;

            let keys = s.cache.keys_through(l, pos)?;
            let values = s.cache.values_through(l, pos)?;
            attend(&self.attention, &s.q, keys, values, pos, &mut s.att, &mut s.xb)?;

            matmul(&mut s.xb2, &s.xb, &w.wo[l * dim * dim..(l + 1) * dim * dim]);
            accumulate(&mut s.x, &s.xb2);

            rmsnorm(&mut s.xb, &s.x, &w.rms_ffn[l * dim..(l + 1) * dim]);
            matmul(&mut s.hb, &s.xb, &w.w1[l * hidden * dim..(l + 1) * hidden * dim]);
            matmul(&mut s.hb2, &s.xb, &w.w3[l * hidden * dim..(l + 1) * hidden * dim]);
            for (h, &up) in s.hb.iter_mut().zip(&s.hb2) {
                *h = silu(*h) * up;
            }
            matmul(&mut s.xb, &s.hb, &w.w2[l * dim * hidden..(l + 1) * dim * hidden]);
            accumulate(&mut s.x, &s.xb);
        }

        rmsnorm_in_place(&mut s.x, &w.rms_final);
        matmul(&mut s.logits, &s.x, w.classifier());
        s.cache.commit(pos)?;

        Ok(&s.logits)
    }
}
