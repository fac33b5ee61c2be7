//! Weight store: checkpoint reading, validation and writing.
//!
//! Checkpoints use the legacy llama2 binary layout: a seven-field `i32`
//! header (see [`ModelConfig::parse_header`]) followed by little-endian `f32`
//! tensors.
//!
//! ```text
//! token_embedding  vocab x dim
//! rms_att          layers x dim
//! wq               layers x dim x dim
//! wk, wv           layers x kv_dim x dim
//! wo               layers x dim x dim
//! rms_ffn          layers x dim
//! w1               layers x hidden x dim
//! w2               layers x dim x hidden
//! w3               layers x hidden x dim
//! rms_final        dim
//! rope tables      2 x seq_len x head_size/2   (skipped on load)
//! wcls             vocab x dim                 (only when not shared)
//! ```
//!
//! Loading memory-maps the file when allowed and falls back to reading it
//! into a buffer. The file length must match the header exactly; tensors are
//! converted into the session's scalar type and the mapping is dropped.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::{ModelConfig, HEADER_LEN};
use crate::numeric::Scalar;
use crate::{Error, Result};

/// Immutable model weights.
#[derive(Debug, Clone)]
pub struct TransformerWeights<T> {
    config: ModelConfig,
    /// Token embedding table (vocab x dim).
    pub token_embedding: Vec<T>,
    /// Attention rmsnorm weights (layers x dim).
    pub rms_att: Vec<T>,
    /// Query projections (layers x dim x dim).
    pub wq: Vec<T>,
    /// Key projections (layers x kv_dim x dim).
    pub wk: Vec<T>,
    /// Value projections (layers x kv_dim x dim).
    pub wv: Vec<T>,
    /// Output projections (layers x dim x dim).
    pub wo: Vec<T>,
    /// Feed-forward rmsnorm weights (layers x dim).
    pub rms_ffn: Vec<T>,
    /// Gate projections (layers x hidden x dim).
    pub w1: Vec<T>,
    /// Down projections (layers x dim x hidden).
    pub w2: Vec<T>,
    /// Up projections (layers x hidden x dim).
    pub w3: Vec<T>,
    /// Final rmsnorm weights (dim).
    pub rms_final: Vec<T>,
    /// Separate classifier, when not shared with the embedding table.
    pub wcls: Option<Vec<T>>,
}

/// Sequential little-endian `f32` reader over checkpoint bytes.
struct TensorReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> TensorReader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<T: Scalar>(&mut self, name: &str, count: usize) -> Result<Vec<T>> {
        let raw = self.slice(name, count)?;
        let mut out = Vec::new();
        out.try_reserve_exact(count)?;
        out.extend(
            raw.chunks_exact(4)
                .map(|c| T::from_stored(f32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
        );
        Ok(out)
    }

    fn skip(&mut self, name: &str, count: usize) -> Result<()> {
        self.slice(name, count).map(|_| ())
    }

    fn slice(&mut self, name: &str, count: usize) -> Result<&'a [u8]> {
        let len = count
            .checked_mul(4)
            .ok_or_else(|| Error::load_failure(format!("{name} size overflows usize")))?;
        let bytes = self.bytes;
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| Error::load_failure(format!("checkpoint truncated in {name}")))?;
        let raw = &bytes[self.offset..end];
        self.offset = end;
        Ok(raw)
    }
}

impl<T: Scalar> TransformerWeights<T> {
    /// Load a checkpoint from disk.
    pub fn load(path: impl AsRef<Path>, use_mmap: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::load_failure(format!("{}: {e}", path.display())))?;

        if use_mmap {
            match map_file(&file) {
                Ok(mmap) => {
                    debug!(path = %path.display(), bytes = mmap.len(), "checkpoint mapped");
                    return Self::from_bytes(&mmap);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "mmap unavailable, reading checkpoint");
                }
            }
        }

        let bytes = std::fs::read(path)
            .map_err(|e| Error::load_failure(format!("{}: {e}", path.display())))?;
        Self::from_bytes(&bytes)
    }

    /// Parse a complete checkpoint image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config = ModelConfig::parse_header(bytes)?;
        let expected = config.checkpoint_len()?;
        if bytes.len() != expected {
            return Err(Error::load_failure(format!(
                "checkpoint is {} bytes, header implies {expected}",
                bytes.len()
            )));
        }

        let dim = config.dim;
        let kv_dim = config.kv_dim();
        let hidden = config.hidden_dim;
        let layers = config.n_layers;
        let vocab = config.vocab_size;

        let mut r = TensorReader::new(&bytes[HEADER_LEN..]);
        let token_embedding = r.take("token_embedding", vocab * dim)?;
        let rms_att = r.take("rms_att", layers * dim)?;
        let wq = r.take("wq", layers * dim * dim)?;
        let wk = r.take("wk", layers * kv_dim * dim)?;
        let wv = r.take("wv", layers * kv_dim * dim)?;
        let wo = r.take("wo", layers * dim * dim)?;
        let rms_ffn = r.take("rms_ffn", layers * dim)?;
        let w1 = r.take("w1", layers * hidden * dim)?;
        let w2 = r.take("w2", layers * dim * hidden)?;
        let w3 = r.take("w3", layers * hidden * dim)?;
        let rms_final = r.take("rms_final", dim)?;
        r.skip("rope tables", 2 * config.seq_len * (config.head_size() / 2))?;
        let wcls = if config.shared_classifier {
            None
        } else {
            Some(r.take("wcls", vocab * dim)?)
        };

        Ok(Self {
            config,
            token_embedding,
            rms_att,
            wq,
            wk,
            wv,
            wo,
            rms_ffn,
            w1,
            w2,
            w3,
            rms_final,
            wcls,
        })
    }

    /// Deterministic pseudo-random weights for a config.
    ///
    /// Projections are uniform in `±1/sqrt(fan_in)` and norm weights are one,
    /// which keeps activations bounded through any number of layers.
    pub fn synthetic(config: &ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);

        let dim = config.dim;
        let kv_dim = config.kv_dim();
        let hidden = config.hidden_dim;
        let layers = config.n_layers;
        let vocab = config.vocab_size;

        let mut uniform = |count: usize, fan_in: usize| -> Result<Vec<T>> {
            let scale = 1.0 / (fan_in as f64).sqrt();
            let mut out = Vec::new();
            out.try_reserve_exact(count)?;
            out.extend((0..count).map(|_| {
                let u: f32 = rng.random();
                T::from_stored(((f64::from(u) * 2.0 - 1.0) * scale) as f32)
            }));
            Ok(out)
        };

        let token_embedding = uniform(vocab * dim, 1)?;
        let wq = uniform(layers * dim * dim, dim)?;
        let wk = uniform(layers * kv_dim * dim, dim)?;
        let wv = uniform(layers * kv_dim * dim, dim)?;
        let wo = uniform(layers * dim * dim, dim)?;
        let w1 = uniform(layers * hidden * dim, dim)?;
        let w2 = uniform(layers * dim * hidden, hidden)?;
        let w3 = uniform(layers * hidden * dim, dim)?;
        let wcls = if config.shared_classifier {
            None
        } else {
            Some(uniform(vocab * dim, dim)?)
        };

        Ok(Self {
            config: *config,
            token_embedding,
            rms_att: vec![T::one(); layers * dim],
            wq,
            wk,
            wv,
            wo,
            rms_ffn: vec![T::one(); layers * dim],
            w1,
            w2,
            w3,
            rms_final: vec![T::one(); dim],
            wcls,
        })
    }

    /// Model dimensions.
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Classifier matrix (vocab x dim).
    pub fn classifier(&self) -> &[T] {
        self.wcls.as_deref().unwrap_or(&self.token_embedding)
    }

    /// Embedding row for a token.
    pub fn embedding(&self, token: usize) -> Result<&[T]> {
        let dim = self.config.dim;
        if token >= self.config.vocab_size {
            return Err(Error::out_of_bounds(format!(
                "token {token} >= vocab_size {}",
                self.config.vocab_size
            )));
        }
        Ok(&self.token_embedding[token * dim..(token + 1) * dim])
    }

    /// Bytes held by all tensors.
    pub fn memory_bytes(&self) -> usize {
        let elems = self.token_embedding.len()
            + self.rms_att.len()
            + self.wq.len()
            + self.wk.len()
            + self.wv.len()
            + self.wo.len()
            + self.rms_ffn.len()
            + self.w1.len()
            + self.w2.len()
            + self.w3.len()
            + self.rms_final.len()
            + self.wcls.as_ref().map_or(0, Vec::len);
        elems * std::mem::size_of::<T>()
    }

    /// Serialize to the checkpoint layout.
    ///
    /// Values are narrowed to `f32`. The rotary tables are written with base
    /// 10000 for compatibility; loading ignores them.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let config = &self.config;
        config.validate()?;

        let mut out = Vec::new();
        out.try_reserve_exact(config.checkpoint_len()?)?;
        out.extend_from_slice(&config.encode_header());

        let tensors = [
            &self.token_embedding,
            &self.rms_att,
            &self.wq,
            &self.wk,
            &self.wv,
            &self.wo,
            &self.rms_ffn,
            &self.w1,
            &self.w2,
            &self.w3,
            &self.rms_final,
        ];
        for tensor in tensors {
            put_f32s(&mut out, tensor.iter().map(|&v| v.widen() as f32));
        }

        let half = config.head_size() / 2;
        let angle = |pos: usize, i: usize| {
            pos as f64 / 10_000f64.powf((2 * i) as f64 / config.head_size() as f64)
        };
        let positions = || (0..config.seq_len).flat_map(move |p| (0..half).map(move |i| (p, i)));
        put_f32s(&mut out, positions().map(|(p, i)| angle(p, i).cos() as f32));
        put_f32s(&mut out, positions().map(|(p, i)| angle(p, i).sin() as f32));

        if let Some(wcls) = &self.wcls {
            put_f32s(&mut out, wcls.iter().map(|&v| v.widen() as f32));
        }

        if out.len() != config.checkpoint_len()? {
            return Err(Error::internal(format!(
                "serialized {} bytes, expected {}",
                out.len(),
                config.checkpoint_len()?
            )));
        }
        Ok(out)
    }
}

fn put_f32s(out: &mut Vec<u8>, values: impl Iterator<Item = f32>) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

#[allow(unsafe_code)]
fn map_file(file: &File) -> std::io::Result<Mmap> {
    // SAFETY: the mapping is read-only and dropped before `load` returns;
    // tensors are copied out, so later changes to the file cannot alias
    // live weights.
    unsafe { Mmap::map(file) }
}

/// Write weights as a checkpoint file.
pub fn write_checkpoint<T: Scalar>(
    path: impl AsRef<Path>,
    weights: &TransformerWeights<T>,
) -> Result<()> {
    let path = path.as_ref();
    let bytes = weights.to_bytes()?;
    let io_err = |e: std::io::Error| Error::internal(format!("{}: {e}", path.display()));

    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&bytes).map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    Ok(())
}
