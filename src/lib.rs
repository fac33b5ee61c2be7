//! llama-engine
//!
//! Embedded, handle-addressable CPU inference for llama-style transformer
//! checkpoints, with background generation and streamed output.
//!
//! # Overview
//!
//! - **Weights**: checkpoint header validation, memory-mapped or buffered loading
//! - **Transformer**: RMSNorm, rotary attention with a KV cache, SwiGLU feed-forward
//! - **Sampling**: greedy argmax or temperature plus nucleus (top-p) with a seeded RNG
//! - **Tokenizer**: scored BPE with byte fallback
//! - **Sessions**: busy flag, cooperative cancellation, generation on a worker thread
//! - **Registry**: monotonic handles and bounded-wait teardown
//! - **Control**: op-id dispatch with host-owned output buffers
//!
//! # Lifecycle
//!
//! ```text
//! create -> load -> generate -> (query_status | query_response)* -> destroy
//!                       \-> abort
//! ```
//!
//! # Examples
//!
//! ```rust
//! use llama_engine::config::EngineConfig;
//! use llama_engine::engine::Engine;
//! use llama_engine::sampling::SamplingConfig;
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! let registry = engine.single().unwrap();
//!
//! let handle = registry.create(SamplingConfig::greedy()).unwrap();
//! let status = registry.query_status(handle).unwrap();
//! assert_eq!(status.progress, 0);
//!
//! // Nothing loaded yet.
//! assert!(registry.generate(handle, "Hello").is_err());
//! registry.destroy(handle).unwrap();
//! ```

// Only checkpoint memory-mapping needs unsafe; it opts in locally.
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::similar_names)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::suboptimal_flops)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::float_cmp)]
#![allow(clippy::too_many_arguments)]

pub mod attention;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod numeric;
pub mod ops;
pub mod profiling;
pub mod registry;
pub mod sampling;
pub mod session;
pub mod state;
pub mod streaming;
pub mod telemetry;
pub mod tokenizer;
pub mod transformer;
pub mod weights;

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
