//! Key/value cache for autoregressive decoding.
//!
//! Holds the key and value projections of every processed position for every
//! layer, laid out as `(layers, seq_len, kv_dim)`. Decoding step `pos` writes
//! row `pos` of each layer and attends over rows `0..=pos`, so earlier
//! positions are never recomputed.
//!
//! # Key Concepts
//!
//! The cache is sized once from the model dimensions when a checkpoint is
//! loaded. Writes beyond `seq_len` are rejected, which is what bounds the
//! decode position of a session.

use crate::config::ModelConfig;
use crate::numeric::{try_zeroed, Scalar};
use crate::{Error, Result};

/// Dense per-session KV cache.
#[derive(Debug, Clone)]
pub struct KvCache<T> {
    n_layers: usize,
    seq_len: usize,
    kv_dim: usize,
    keys: Vec<T>,
    values: Vec<T>,
    /// Positions committed so far (the next position to decode).
    len: usize,
}

impl<T: Scalar> KvCache<T> {
    /// Allocate a zeroed cache.
    pub fn new(n_layers: usize, seq_len: usize, kv_dim: usize) -> Result<Self> {
        let total = n_layers
            .checked_mul(seq_len)
            .and_then(|n| n.checked_mul(kv_dim))
            .ok_or_else(|| Error::out_of_memory("kv cache size overflows usize"))?;

        Ok(Self {
            n_layers,
            seq_len,
            kv_dim,
            keys: try_zeroed(total)?,
            values: try_zeroed(total)?,
            len: 0,
        })
    }

    /// Allocate a cache sized for a model.
    pub fn for_model(config: &ModelConfig) -> Result<Self> {
        Self::new(config.n_layers, config.seq_len, config.kv_dim())
    }

    /// Maximum number of positions.
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Width of one cached row.
    pub const fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    /// Number of layers.
    pub const fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// Positions committed so far.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if no position has been committed.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes held by keys and values.
    pub fn memory_bytes(&self) -> usize {
        (self.keys.len() + self.values.len()) * std::mem::size_of::<T>()
    }

    fn offset(&self, layer: usize, pos: usize) -> Result<usize> {
        if layer >= self.n_layers {
            return Err(Error::out_of_bounds(format!(
                "layer {layer} >= n_layers {}",
                self.n_layers
            )));
        }
        if pos >= self.seq_len {
            return Err(Error::out_of_bounds(format!(
                "position {pos} >= seq_len {}",
                self.seq_len
            )));
        }
        Ok((layer * self.seq_len + pos) * self.kv_dim)
    }

    /// Write the key and value rows for `(layer, pos)`.
    pub fn store(&mut self, layer: usize, pos: usize, key: &[T], value: &[T]) -> Result<()> {
        if key.len() != self.kv_dim || value.len() != self.kv_dim {
            return Err(Error::invalid_argument(format!(
                "kv row length {}/{} != kv_dim {}",
                key.len(),
                value.len(),
                self.kv_dim
            )));
        }
        let start = self.offset(layer, pos)?;
        let end = start + self.kv_dim;
        self.keys[start..end].copy_from_slice(key);
        self.values[start..end].copy_from_slice(value);
        Ok(())
    }

    /// Cached key row.
    pub fn key(&self, layer: usize, pos: usize) -> Result<&[T]> {
        let start = self.offset(layer, pos)?;
        Ok(&self.keys[start..start + self.kv_dim])
    }

    /// Cached value row.
    pub fn value(&self, layer: usize, pos: usize) -> Result<&[T]> {
        let start = self.offset(layer, pos)?;
        Ok(&self.values[start..start + self.kv_dim])
    }

    /// Key rows `0..=pos` of one layer, contiguous.
    pub fn keys_through(&self, layer: usize, pos: usize) -> Result<&[T]> {
        let start = self.offset(layer, 0)?;
        let end = self.offset(layer, pos)? + self.kv_dim;
        Ok(&self.keys[start..end])
    }

    /// Value rows `0..=pos` of one layer, contiguous.
    pub fn values_through(&self, layer: usize, pos: usize) -> Result<&[T]> {
        let start = self.offset(layer, 0)?;
        let end = self.offset(layer, pos)? + self.kv_dim;
        Ok(&self.values[start..end])
    }

    /// Mark `pos` as fully written for every layer.
    pub fn commit(&mut self, pos: usize) -> Result<()> {
        if pos >= self.seq_len {
            return Err(Error::out_of_bounds(format!(
                "position {pos} >= seq_len {}",
                self.seq_len
            )));
        }
        self.len = pos + 1;
        Ok(())
    }

    /// Forget committed positions; rows are overwritten by the next run.
    pub fn reset(&mut self) {
        self.len = 0;
    }
}
