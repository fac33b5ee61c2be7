//! Attention for single-token decoding.
//!
//! Each decoding step produces one query per head and attends over the keys
//! and values cached for positions `0..=pos` of the current layer.
//!
//! # Key Concepts
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! Attention(q, K, V) = softmax(q @ K^T / sqrt(head_size)) @ V
//! ```
//!
//! Only cached positions up to and including the current one are read, so
//! causal masking falls out of the cache layout instead of an explicit mask.
//!
//! ## Grouped-Query Attention
//!
//! With fewer KV heads than query heads, query head `h` reads KV head
//! `h / kv_mul`.
//!
//! ## Rotary Position Encoding
//!
//! Adjacent feature pairs `(2i, 2i + 1)` are rotated by `pos * freq`, where
//! `freq = theta^(-(i mod head_size) / head_size)`. The rotation depends only
//! on position and head size, so the table is computed once per load.

use crate::config::ModelConfig;
use crate::numeric::{try_zeroed, Scalar};
use crate::ops::{dot, softmax};
use crate::{Error, Result};

/// Attention head layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionConfig {
    /// Number of query heads.
    pub n_heads: usize,

    /// Number of KV heads.
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_size: usize,

    /// Maximum attended positions.
    pub seq_len: usize,
}

impl AttentionConfig {
    /// Create a config with one KV head per query head.
    pub const fn new(n_heads: usize, head_size: usize, seq_len: usize) -> Self {
        Self {
            n_heads,
            n_kv_heads: n_heads,
            head_size,
            seq_len,
        }
    }

    /// Derive the layout from model dimensions.
    pub const fn from_model(config: &ModelConfig) -> Self {
        Self {
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_size: config.head_size(),
            seq_len: config.seq_len,
        }
    }

    /// Set number of KV heads.
    pub const fn n_kv_heads(mut self, n: usize) -> Self {
        self.n_kv_heads = n;
        self
    }

    /// Query heads per KV head.
    pub const fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Width of a query vector.
    pub const fn dim(&self) -> usize {
        self.n_heads * self.head_size
    }

    /// Width of a cached key or value row.
    pub const fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_size
    }

    /// Check if using grouped-query attention.
    pub const fn is_gqa(&self) -> bool {
        self.n_kv_heads < self.n_heads
    }

    /// Score scale factor, `1 / sqrt(head_size)`.
    pub fn scale<T: Scalar>(&self) -> T {
        T::one() / T::narrow(self.head_size as f64).sqrt()
    }
}

/// Attend one query vector over cached positions `0..=pos`.
///
/// `keys` and `values` hold `pos + 1` rows of `kv_dim` each. `att` is the
/// per-session score buffer of `n_heads * seq_len`; `out` receives the
/// concatenated head outputs.
///
/// # Examples
///
/// ```rust
/// use llama_engine::attention::{attend, AttentionConfig};
///
/// let config = AttentionConfig::new(1, 2, 4);
/// let q = [1.0f32, 0.0];
/// // Two cached positions with identical keys attend uniformly.
/// let keys = [1.0f32, 0.0, 1.0, 0.0];
/// let values = [2.0f32, 0.0, 4.0, 0.0];
/// let mut att = [0.0f32; 4];
/// let mut out = [0.0f32; 2];
///
/// attend(&config, &q, &keys, &values, 1, &mut att, &mut out).unwrap();
/// assert!((out[0] - 3.0).abs() < 1e-6);
/// ```
pub fn attend<T: Scalar>(
    config: &AttentionConfig,
    q: &[T],
    keys: &[T],
    values: &[T],
    pos: usize,
    att: &mut [T],
    out: &mut [T],
) -> Result<()> {
    let hs = config.head_size;
    let kv_dim = config.kv_dim();
    let rows = pos + 1;

    if pos >= config.seq_len {
        return Err(Error::out_of_bounds(format!(
            "position {pos} >= seq_len {}",
            config.seq_len
        )));
    }
    if q.len() != config.dim() || out.len() != config.dim() {
        return Err(Error::invalid_argument("query/output width != n_heads * head_size"));
    }
    if keys.len() < rows * kv_dim || values.len() < rows * kv_dim {
        return Err(Error::invalid_argument(format!(
            "kv slices hold fewer than {rows} rows"
        )));
    }
    if att.len() < config.n_heads * config.seq_len {
        return Err(Error::invalid_argument("score buffer smaller than n_heads * seq_len"));
    }

    let scale: T = config.scale();
    let kv_mul = config.kv_mul();

    for h in 0..config.n_heads {
        let q_h = &q[h * hs..(h + 1) * hs];
        let kv_off = (h / kv_mul) * hs;
        let scores = &mut att[h * config.seq_len..h * config.seq_len + rows];

        for (t, score) in scores.iter_mut().enumerate() {
            let k = &keys[t * kv_dim + kv_off..t * kv_dim + kv_off + hs];
            *score = dot(q_h, k) * scale;
        }
        softmax(scores);

        let out_h = &mut out[h * hs..(h + 1) * hs];
        out_h.fill(T::zero());
        for (t, &a) in scores.iter().enumerate() {
            let v = &values[t * kv_dim + kv_off..t * kv_dim + kv_off + hs];
            for (o, &vi) in out_h.iter_mut().zip(v) {
                *o += a * vi;
            }
        }
    }

    Ok(())
}

/// Precomputed rotary position table.
///
/// Stores `cos`/`sin` for every position and every rotated pair across all
/// heads, `seq_len * dim / 2` entries each.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding<T> {
    dim: usize,
    kv_dim: usize,
    head_size: usize,
    seq_len: usize,
    theta: f32,
    freq_real: Vec<T>,
    freq_imag: Vec<T>,
}

impl<T: Scalar> RotaryEmbedding<T> {
    /// Build the table for a model.
    pub fn new(config: &ModelConfig, theta: f32) -> Result<Self> {
        let dim = config.dim;
        let head_size = config.head_size();
        let half = dim / 2;
        let len = config
            .seq_len
            .checked_mul(half)
            .ok_or_else(|| Error::out_of_memory("rotary table size overflows usize"))?;

        let mut freq_real: Vec<T> = try_zeroed(len)?;
        let mut freq_imag: Vec<T> = try_zeroed(len)?;

        let theta_f = f64::from(theta);
        for pos in 0..config.seq_len {
            for pair in 0..half {
                let head_dim = (2 * pair) % head_size;
                let freq = 1.0 / theta_f.powf(head_dim as f64 / head_size as f64);
                let angle = pos as f64 * freq;
                freq_real[pos * half + pair] = T::narrow(angle.cos());
                freq_imag[pos * half + pair] = T::narrow(angle.sin());
            }
        }

        Ok(Self {
            dim,
            kv_dim: config.kv_dim(),
            head_size,
            seq_len: config.seq_len,
            theta,
            freq_real,
            freq_imag,
        })
    }

    /// Head dimension.
    pub const fn head_size(&self) -> usize {
        self.head_size
    }

    /// Number of positions covered.
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Frequency base.
    pub const fn theta(&self) -> f32 {
        self.theta
    }

    /// `(cos, sin)` rows for one position.
    pub fn row(&self, pos: usize) -> Result<(&[T], &[T])> {
        if pos >= self.seq_len {
            return Err(Error::out_of_bounds(format!(
                "position {pos} >= seq_len {}",
                self.seq_len
            )));
        }
        let half = self.dim / 2;
        let range = pos * half..(pos + 1) * half;
        Ok((&self.freq_real[range.clone()], &self.freq_imag[range]))
    }

    /// Rotate `q` (width `dim`) and `k` (width `kv_dim`) for position `pos`.
    pub fn apply(&self, q: &mut [T], k: &mut [T], pos: usize) -> Result<()> {
        if q.len() != self.dim || k.len() != self.kv_dim {
            return Err(Error::invalid_argument("rotary input width mismatch"));
        }
        let (cos, sin) = self.row(pos)?;

        for (pair, (&fcr, &fci)) in cos.iter().zip(sin).enumerate() {
            let i = 2 * pair;
            rotate(&mut q[i..i + 2], fcr, fci);
            if i < self.kv_dim {
                rotate(&mut k[i..i + 2], fcr, fci);
            }
        }
        Ok(())
    }
}

#[inline]
fn rotate<T: Scalar>(pair: &mut [T], fcr: T, fci: T) {
    let (v0, v1) = (pair[0], pair[1]);
    pair[0] = v0 * fcr - v1 * fci;
    pair[1] = v0 * fci + v1 * fcr;
}
