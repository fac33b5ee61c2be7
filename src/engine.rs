//! Process-level engine.
//!
//! An [`Engine`] owns one [`Registry`] per precision and is passed by
//! reference to whatever exposes the control surface. Construct it once at
//! startup and call [`Engine::shutdown`] before exit.
//!
//! # Examples
//!
//! ```rust
//! use llama_engine::config::EngineConfig;
//! use llama_engine::engine::Engine;
//! use llama_engine::sampling::SamplingConfig;
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! let h = engine.single().unwrap().create(SamplingConfig::greedy()).unwrap();
//! assert_eq!(h, 1);
//!
//! // Precisions have independent handle spaces.
//! assert_eq!(engine.double().unwrap().create(SamplingConfig::greedy()).unwrap(), 1);
//!
//! engine.shutdown();
//! assert!(engine.single().is_err());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::EngineConfig;
use crate::registry::Registry;
use crate::{Error, Result};

/// Registries for both precisions.
#[derive(Debug)]
pub struct Engine {
    single: Registry<f32>,
    double: Registry<f64>,
    running: AtomicBool,
}

impl Engine {
    /// Create an engine with empty registries.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        info!(
            teardown_poll_ms = config.teardown_poll_ms,
            teardown_max_attempts = config.teardown_max_attempts,
            use_mmap = config.use_mmap,
            "engine initialized"
        );
        Ok(Self {
            single: Registry::new(config.clone())?,
            double: Registry::new(config)?,
            running: AtomicBool::new(true),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::not_initialized("engine is shut down"))
        }
    }

    /// Single-precision registry.
    pub fn single(&self) -> Result<&Registry<f32>> {
        self.ensure_running()?;
        Ok(&self.single)
    }

    /// Double-precision registry.
    pub fn double(&self) -> Result<&Registry<f64>> {
        self.ensure_running()?;
        Ok(&self.double)
    }

    /// Check if the engine accepts operations.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Destroy every session in both registries.
    ///
    /// Returns how many sessions were abandoned. Later calls are no-ops.
    pub fn shutdown(&self) -> usize {
        if !self.running.swap(false, Ordering::AcqRel) {
            return 0;
        }
        let abandoned = self.single.shutdown() + self.double.shutdown();
        info!(abandoned, "engine shut down");
        abandoned
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingConfig;

    #[test]
    fn test_new_rejects_bad_config() {
        let err = Engine::new(EngineConfig::default().rope_theta(0.0)).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_registries_are_independent() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let single = engine.single().unwrap();
        let double = engine.double().unwrap();
        single.create(SamplingConfig::default()).unwrap();
        single.create(SamplingConfig::default()).unwrap();
        assert_eq!(double.create(SamplingConfig::default()).unwrap(), 1);
        assert_eq!(single.len(), 2);
        assert_eq!(double.len(), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        engine.single().unwrap().create(SamplingConfig::default()).unwrap();
        assert_eq!(engine.shutdown(), 0);
        assert!(!engine.is_running());
        assert_eq!(engine.shutdown(), 0);
        assert_eq!(engine.double().unwrap_err().code(), "NOT_INITIALIZED");
    }
}
