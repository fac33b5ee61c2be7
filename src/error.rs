//! Error types for the inference engine.
//!
//! Every control operation returns a [`Result`]; nothing panics across the
//! engine boundary. Each variant maps to a stable numeric status code so a
//! thin transport layer can report failures without inspecting messages.
//!
//! # Examples
//!
//! ```rust
//! use llama_engine::{Error, Result};
//!
//! fn check_position(pos: usize, seq_len: usize) -> Result<()> {
//!     if pos >= seq_len {
//!         return Err(Error::out_of_bounds(format!(
//!             "position {pos} >= seq_len {seq_len}"
//!         )));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_position(3, 4).is_ok());
//! assert_eq!(check_position(4, 4).unwrap_err().code(), "OUT_OF_BOUNDS");
//! ```

use std::collections::TryReserveError;

/// Main error type for the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// An engine-level dependency is missing (engine shut down or never set up).
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// Unknown or already-destroyed session handle.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Allocation failed while creating a session or loading weights.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Another operation currently owns the session.
    #[error("session busy: {0}")]
    AlreadyBusy(String),

    /// Work stopped because cancellation was requested.
    ///
    /// Recorded as the failure of an aborted generation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Malformed or truncated checkpoint or tokenizer file.
    #[error("load failure: {0}")]
    LoadFailure(String),

    /// Unrecognized control operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Position or token id outside what the loaded model supports.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Operation not valid in the session's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Argument rejected by validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Tokenizer capability failed to encode or decode.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Internal error (worker spawn failure, worker panic).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-initialized error.
    pub fn not_initialized(msg: impl Into<String>) -> Self {
        Self::NotInitialized(msg.into())
    }

    /// Create an invalid-handle error.
    pub fn invalid_handle(msg: impl Into<String>) -> Self {
        Self::InvalidHandle(msg.into())
    }

    /// Create an out-of-memory error.
    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    /// Create an already-busy error.
    pub fn already_busy(msg: impl Into<String>) -> Self {
        Self::AlreadyBusy(msg.into())
    }

    /// Create a cancelled error.
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a load-failure error.
    pub fn load_failure(msg: impl Into<String>) -> Self {
        Self::LoadFailure(msg.into())
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an out-of-bounds error.
    pub fn out_of_bounds(msg: impl Into<String>) -> Self {
        Self::OutOfBounds(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a tokenizer error.
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the caller can reasonably retry the same call later.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use llama_engine::Error;
    ///
    /// assert!(Error::already_busy("generating").is_retryable());
    /// assert!(!Error::invalid_handle("7").is_retryable());
    /// ```
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::AlreadyBusy(_))
    }

    /// Check if the error was caused by the caller's input.
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidHandle(_)
                | Self::InvalidArgument(_)
                | Self::InvalidState(_)
                | Self::OutOfBounds(_)
                | Self::Unsupported(_)
        )
    }

    /// Get error code for logging.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use llama_engine::Error;
    ///
    /// assert_eq!(Error::load_failure("short read").code(), "LOAD_FAILURE");
    /// ```
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "NOT_INITIALIZED",
            Self::InvalidHandle(_) => "INVALID_HANDLE",
            Self::OutOfMemory(_) => "OUT_OF_MEMORY",
            Self::AlreadyBusy(_) => "ALREADY_BUSY",
            Self::Cancelled(_) => "CANCELLED",
            Self::LoadFailure(_) => "LOAD_FAILURE",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::OutOfBounds(_) => "OUT_OF_BOUNDS",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Tokenizer(_) => "TOKENIZER",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Stable numeric status code reported by the control surface.
    ///
    /// Zero is reserved for success.
    pub const fn status_code(&self) -> i32 {
        match self {
            Self::NotInitialized(_) => 1,
            Self::InvalidHandle(_) => 2,
            Self::OutOfMemory(_) => 3,
            Self::AlreadyBusy(_) => 4,
            Self::Cancelled(_) => 5,
            Self::LoadFailure(_) => 6,
            Self::Unsupported(_) => 7,
            Self::OutOfBounds(_) => 8,
            Self::InvalidState(_) => 9,
            Self::InvalidArgument(_) => 10,
            Self::Tokenizer(_) => 11,
            Self::Internal(_) => 12,
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(e: TryReserveError) -> Self {
        Self::OutOfMemory(e.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::invalid_handle("42");
        assert_eq!(err.code(), "INVALID_HANDLE");
        assert!(err.is_caller_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::load_failure("header mismatch");
        assert_eq!(format!("{err}"), "load failure: header mismatch");
        assert_eq!(
            format!("{}", Error::already_busy("handle 1")),
            "session busy: handle 1"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::not_initialized("").code(), "NOT_INITIALIZED");
        assert_eq!(Error::invalid_handle("").code(), "INVALID_HANDLE");
        assert_eq!(Error::out_of_memory("").code(), "OUT_OF_MEMORY");
        assert_eq!(Error::already_busy("").code(), "ALREADY_BUSY");
        assert_eq!(Error::cancelled("").code(), "CANCELLED");
        assert_eq!(Error::load_failure("").code(), "LOAD_FAILURE");
        assert_eq!(Error::unsupported("").code(), "UNSUPPORTED");
        assert_eq!(Error::out_of_bounds("").code(), "OUT_OF_BOUNDS");
        assert_eq!(Error::invalid_state("").code(), "INVALID_STATE");
        assert_eq!(Error::invalid_argument("").code(), "INVALID_ARGUMENT");
        assert_eq!(Error::tokenizer("").code(), "TOKENIZER");
        assert_eq!(Error::internal("").code(), "INTERNAL");
    }

    #[test]
    fn test_status_codes_unique_and_nonzero() {
        let all = [
            Error::not_initialized(""),
            Error::invalid_handle(""),
            Error::out_of_memory(""),
            Error::already_busy(""),
            Error::cancelled(""),
            Error::load_failure(""),
            Error::unsupported(""),
            Error::out_of_bounds(""),
            Error::invalid_state(""),
            Error::invalid_argument(""),
            Error::tokenizer(""),
            Error::internal(""),
        ];
        let mut codes: Vec<i32> = all.iter().map(Error::status_code).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_try_reserve_maps_to_out_of_memory() {
        let mut v: Vec<u64> = Vec::new();
        let err: Error = v.try_reserve_exact(usize::MAX).unwrap_err().into();
        assert_eq!(err.code(), "OUT_OF_MEMORY");
    }

    #[test]
    fn test_caller_vs_engine_errors() {
        assert!(Error::unsupported("op 99").is_caller_error());
        assert!(Error::out_of_bounds("pos").is_caller_error());
        assert!(!Error::load_failure("").is_caller_error());
        assert!(!Error::internal("").is_caller_error());
        assert!(Error::already_busy("").is_retryable());
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(Error::cancelled("a"), Error::cancelled("a"));
        assert_ne!(Error::cancelled("a"), Error::cancelled("b"));
        assert_ne!(Error::cancelled("a"), Error::internal("a"));
    }
}
