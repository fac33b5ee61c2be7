//! Model and engine configuration.
//!
//! [`ModelConfig`] is the dimension header at the front of every checkpoint.
//! [`EngineConfig`] holds process-wide policy: teardown backoff, generation
//! step limits, rotary base, stop tokens and tokenizer resolution.
//!
//! # Examples
//!
//! ```rust
//! use llama_engine::config::{EngineConfig, ModelConfig};
//!
//! let model = ModelConfig::new(288, 768, 6, 6, 32000, 256).n_kv_heads(6);
//! assert!(model.validate().is_ok());
//! assert_eq!(model.head_size(), 48);
//!
//! let engine = EngineConfig::default().max_steps(128).teardown_max_attempts(4);
//! assert_eq!(engine.steps_for(&model), 128);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of bytes in the checkpoint header (seven `i32` fields).
pub const HEADER_LEN: usize = 7 * 4;

/// Transformer dimension parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding (model) dimension.
    pub dim: usize,

    /// Feed-forward hidden dimension.
    pub hidden_dim: usize,

    /// Number of transformer layers.
    pub n_layers: usize,

    /// Number of query heads.
    pub n_heads: usize,

    /// Number of key/value heads (fewer than `n_heads` for grouped-query attention).
    pub n_kv_heads: usize,

    /// Vocabulary size.
    pub vocab_size: usize,

    /// Maximum sequence length.
    pub seq_len: usize,

    /// Whether the classifier aliases the token embedding table.
    pub shared_classifier: bool,
}

impl ModelConfig {
    /// Create a config with one KV head per query head and a shared classifier.
    pub const fn new(
        dim: usize,
        hidden_dim: usize,
        n_layers: usize,
        n_heads: usize,
        vocab_size: usize,
        seq_len: usize,
    ) -> Self {
        Self {
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads: n_heads,
            vocab_size,
            seq_len,
            shared_classifier: true,
        }
    }

    /// Set number of KV heads.
    pub const fn n_kv_heads(mut self, n: usize) -> Self {
        self.n_kv_heads = n;
        self
    }

    /// Set whether the classifier is shared with the embedding table.
    pub const fn shared_classifier(mut self, shared: bool) -> Self {
        self.shared_classifier = shared;
        self
    }

    /// Dimension of one attention head.
    pub const fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of the key/value projections.
    pub const fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Query heads sharing each KV head.
    pub const fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Validate dimension parameters.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(Error::load_failure(format!("{name} must be > 0")));
            }
            if i32::try_from(value).is_err() {
                return Err(Error::load_failure(format!("{name} = {value} exceeds i32")));
            }
        }
        if self.dim % self.n_heads != 0 {
            return Err(Error::load_failure(format!(
                "dim {} not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_kv_heads > self.n_heads || self.n_heads % self.n_kv_heads != 0 {
            return Err(Error::load_failure(format!(
                "n_heads {} not a multiple of n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.head_size() % 2 != 0 {
            return Err(Error::load_failure(format!(
                "head_size {} must be even for rotary encoding",
                self.head_size()
            )));
        }
        Ok(())
    }

    /// Parse and validate the checkpoint header.
    ///
    /// A negative vocabulary size marks an unshared classifier.
    pub fn parse_header(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::load_failure(format!(
                "checkpoint is {} bytes, header needs {HEADER_LEN}",
                bytes.len()
            )));
        }

        let mut fields = [0i32; 7];
        for (field, chunk) in fields.iter_mut().zip(bytes[..HEADER_LEN].chunks_exact(4)) {
            *field = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let [dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab, seq_len] = fields;

        let positive = |name: &str, v: i32| -> Result<usize> {
            usize::try_from(v)
                .ok()
                .filter(|&v| v > 0)
                .ok_or_else(|| Error::load_failure(format!("header field {name} = {v}")))
        };

        let config = Self {
            dim: positive("dim", dim)?,
            hidden_dim: positive("hidden_dim", hidden_dim)?,
            n_layers: positive("n_layers", n_layers)?,
            n_heads: positive("n_heads", n_heads)?,
            n_kv_heads: positive("n_kv_heads", n_kv_heads)?,
            vocab_size: positive("vocab_size", vocab.checked_abs().unwrap_or(0))?,
            seq_len: positive("seq_len", seq_len)?,
            shared_classifier: vocab > 0,
        };
        config.validate()?;
        Ok(config)
    }

    /// Encode the header.
    ///
    /// Values must already be validated to fit in `i32`.
    pub fn encode_header(&self) -> [u8; HEADER_LEN] {
        let vocab = self.vocab_size as i32;
        let fields = [
            self.dim as i32,
            self.hidden_dim as i32,
            self.n_layers as i32,
            self.n_heads as i32,
            self.n_kv_heads as i32,
            if self.shared_classifier { vocab } else { -vocab },
            self.seq_len as i32,
        ];
        let mut out = [0u8; HEADER_LEN];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    /// Number of `f32` values stored after the header.
    pub fn stored_elements(&self) -> Result<usize> {
        let dim = self.dim;
        let kv_dim = self.kv_dim();
        let layers = self.n_layers;
        let rope_half = self.head_size() / 2;

        let parts = [
            product(&[self.vocab_size, dim])?,
            product(&[layers, dim])?,
            product(&[layers, dim, dim])?,
            product(&[layers, dim, kv_dim])?,
            product(&[layers, dim, kv_dim])?,
            product(&[layers, dim, dim])?,
            product(&[layers, dim])?,
            product(&[layers, dim, self.hidden_dim])?,
            product(&[layers, self.hidden_dim, dim])?,
            product(&[layers, dim, self.hidden_dim])?,
            dim,
            product(&[2, self.seq_len, rope_half])?,
            if self.shared_classifier {
                0
            } else {
                product(&[self.vocab_size, dim])?
            },
        ];

        parts.iter().try_fold(0usize, |acc, &p| {
            acc.checked_add(p)
                .ok_or_else(|| Error::load_failure("checkpoint size overflows usize"))
        })
    }

    /// Exact byte length of a checkpoint with this header.
    pub fn checkpoint_len(&self) -> Result<usize> {
        self.stored_elements()?
            .checked_mul(4)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or_else(|| Error::load_failure("checkpoint size overflows usize"))
    }

    /// Number of learned parameters (excludes the legacy rotary tables).
    pub fn param_count(&self) -> Result<usize> {
        let rope = product(&[2, self.seq_len, self.head_size() / 2])?;
        Ok(self.stored_elements()? - rope)
    }
}

fn product(parts: &[usize]) -> Result<usize> {
    parts
        .iter()
        .try_fold(1usize, |acc, &p| acc.checked_mul(p))
        .ok_or_else(|| Error::load_failure("tensor size overflows usize"))
}

/// Engine-wide policy.
///
/// Deserializes from JSON with every field optional.
///
/// # Examples
///
/// ```rust
/// use llama_engine::config::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{"teardown_poll_ms": 10, "max_steps": 64}"#).unwrap();
/// assert_eq!(config.teardown_poll_ms, 10);
/// assert_eq!(config.max_steps, Some(64));
/// assert_eq!(config.teardown_max_attempts, 12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between busy-flag polls during teardown, in milliseconds.
    pub teardown_poll_ms: u64,

    /// Maximum busy-flag polls before a session is abandoned.
    pub teardown_max_attempts: u32,

    /// Maximum positions per generate call (None = model seq_len).
    pub max_steps: Option<usize>,

    /// Rotary encoding base.
    pub rope_theta: f32,

    /// Sampled tokens that end generation.
    pub stop_token_ids: Vec<u32>,

    /// Prepend BOS when encoding prompts.
    pub add_bos: bool,

    /// Tokenizer file (None = `tokenizer.bin` next to the checkpoint).
    pub tokenizer_path: Option<PathBuf>,

    /// Memory-map checkpoints when possible.
    pub use_mmap: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            teardown_poll_ms: 250,
            teardown_max_attempts: 12,
            max_steps: None,
            rope_theta: 10_000.0,
            stop_token_ids: vec![1, 2],
            add_bos: true,
            tokenizer_path: None,
            use_mmap: true,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::invalid_argument(format!("engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set teardown poll interval in milliseconds.
    pub const fn teardown_poll_ms(mut self, ms: u64) -> Self {
        self.teardown_poll_ms = ms;
        self
    }

    /// Set maximum teardown poll attempts.
    pub const fn teardown_max_attempts(mut self, attempts: u32) -> Self {
        self.teardown_max_attempts = attempts;
        self
    }

    /// Set maximum positions per generate call.
    pub const fn max_steps(mut self, steps: usize) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Set rotary encoding base.
    pub const fn rope_theta(mut self, theta: f32) -> Self {
        self.rope_theta = theta;
        self
    }

    /// Set stop tokens.
    pub fn stop_token_ids(mut self, ids: impl Into<Vec<u32>>) -> Self {
        self.stop_token_ids = ids.into();
        self
    }

    /// Set whether prompts start with BOS.
    pub const fn add_bos(mut self, add: bool) -> Self {
        self.add_bos = add;
        self
    }

    /// Set tokenizer file path.
    pub fn tokenizer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tokenizer_path = Some(path.into());
        self
    }

    /// Set whether to memory-map checkpoints.
    pub const fn use_mmap(mut self, enabled: bool) -> Self {
        self.use_mmap = enabled;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == Some(0) {
            return Err(Error::invalid_argument("max_steps must be > 0"));
        }
        if !(self.rope_theta.is_finite() && self.rope_theta > 0.0) {
            return Err(Error::invalid_argument("rope_theta must be finite and > 0"));
        }
        Ok(())
    }

    /// Interval between teardown polls.
    pub const fn teardown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.teardown_poll_ms)
    }

    /// Upper bound on how long `destroy` waits.
    pub fn teardown_ceiling(&self) -> Duration {
        self.teardown_poll_interval() * self.teardown_max_attempts
    }

    /// Positions a generate call runs for a given model.
    pub fn steps_for(&self, model: &ModelConfig) -> usize {
        self.max_steps
            .map_or(model.seq_len, |steps| steps.min(model.seq_len))
    }

    /// Whether a sampled token ends generation.
    pub fn is_stop_token(&self, token: u32) -> bool {
        self.stop_token_ids.contains(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ModelConfig {
        ModelConfig::new(8, 16, 2, 2, 32, 16)
    }

    #[test]
    fn test_model_config_derived() {
        let config = ModelConfig::new(64, 128, 2, 8, 100, 32).n_kv_heads(2);
        assert_eq!(config.head_size(), 8);
        assert_eq!(config.kv_dim(), 16);
        assert_eq!(config.kv_mul(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_config_validate() {
        assert!(tiny().validate().is_ok());
        assert!(ModelConfig::new(0, 16, 2, 2, 32, 16).validate().is_err());
        // dim not divisible by heads
        assert!(ModelConfig::new(9, 16, 2, 2, 32, 16).validate().is_err());
        // kv heads must divide heads
        assert!(ModelConfig::new(12, 16, 2, 3, 32, 16)
            .n_kv_heads(2)
            .validate()
            .is_err());
        // odd head size
        assert!(ModelConfig::new(6, 16, 2, 2, 32, 16).validate().is_err());
    }

    #[test]
    fn test_header_encode_parse() {
        let config = tiny().shared_classifier(false);
        let header = config.encode_header();
        let parsed = ModelConfig::parse_header(&header).unwrap();
        assert_eq!(parsed, config);
        assert!(!parsed.shared_classifier);
    }

    #[test]
    fn test_header_too_short() {
        let err = ModelConfig::parse_header(&[0u8; 10]).unwrap_err();
        assert_eq!(err.code(), "LOAD_FAILURE");
    }

    #[test]
    fn test_header_rejects_non_positive() {
        let mut header = tiny().encode_header();
        header[8..12].copy_from_slice(&0i32.to_le_bytes());
        assert!(ModelConfig::parse_header(&header).is_err());

        let mut header = tiny().encode_header();
        header[24..28].copy_from_slice(&(-5i32).to_le_bytes());
        assert!(ModelConfig::parse_header(&header).is_err());
    }

    #[test]
    fn test_checkpoint_len() {
        let config = tiny();
        // embed 32*8, rms 2*8, wq/wk/wv/wo 4*2*8*8, rms_ffn 2*8,
        // w1/w2/w3 3*2*8*16, final 8, rope 2*16*2
        let expected = 256 + 16 + 512 + 16 + 768 + 8 + 64;
        assert_eq!(config.stored_elements().unwrap(), expected);
        assert_eq!(config.checkpoint_len().unwrap(), HEADER_LEN + 4 * expected);

        let unshared = config.shared_classifier(false);
        assert_eq!(unshared.stored_elements().unwrap(), expected + 256);
        assert_eq!(config.param_count().unwrap(), expected - 64);
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.teardown_poll_ms, 250);
        assert_eq!(config.teardown_max_attempts, 12);
        assert_eq!(config.teardown_ceiling(), Duration::from_secs(3));
        assert!(config.is_stop_token(1));
        assert!(config.is_stop_token(2));
        assert!(!config.is_stop_token(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::default()
            .teardown_poll_ms(5)
            .teardown_max_attempts(3)
            .max_steps(8)
            .rope_theta(500_000.0)
            .stop_token_ids(vec![])
            .add_bos(false)
            .tokenizer_path("/tmp/tok.bin")
            .use_mmap(false);

        assert_eq!(config.teardown_poll_interval(), Duration::from_millis(5));
        assert_eq!(config.steps_for(&tiny()), 8);
        assert!(!config.is_stop_token(1));
        assert!(!config.add_bos);
        assert!(!config.use_mmap);
        assert_eq!(config.tokenizer_path, Some(PathBuf::from("/tmp/tok.bin")));
    }

    #[test]
    fn test_steps_clamped_to_seq_len() {
        let config = EngineConfig::default().max_steps(1000);
        assert_eq!(config.steps_for(&tiny()), 16);
        assert_eq!(EngineConfig::default().steps_for(&tiny()), 16);
    }

    #[test]
    fn test_engine_config_validate() {
        assert!(EngineConfig::default().max_steps(0).validate().is_err());
        assert!(EngineConfig::default().rope_theta(0.0).validate().is_err());
        assert!(EngineConfig::default().rope_theta(f32::NAN).validate().is_err());
    }

    #[test]
    fn test_engine_config_from_json() {
        let config = EngineConfig::from_json(r#"{"stop_token_ids": [7], "use_mmap": false}"#)
            .unwrap();
        assert_eq!(config.stop_token_ids, vec![7]);
        assert!(!config.use_mmap);

        let err = EngineConfig::from_json("{not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");

        let err = EngineConfig::from_json(r#"{"max_steps": 0}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }
}
