//! Session registry.
//!
//! Maps opaque handles to sessions for one numeric precision.
//!
//! # Key Concepts
//!
//! ## Handles
//!
//! Handles start at 1 and increase monotonically. A destroyed handle is
//! never reissued, so a late status from a finishing worker cannot be
//! mistaken for a newer session.
//!
//! ## Lookup With Busy
//!
//! [`Registry::lookup`] can claim the session's busy flag inside the map
//! critical section. A session found this way cannot be torn down before
//! the caller acts on it.
//!
//! ## Bounded Teardown
//!
//! [`Registry::destroy`] unlinks the handle first, requests cancellation,
//! then polls the busy flag at a fixed interval. A session that never
//! quiesces is moved to an abandoned list instead of being freed; its
//! memory stays alive until [`Registry::reap`] finds it idle.
//!
//! # Examples
//!
//! ```rust
//! use llama_engine::config::EngineConfig;
//! use llama_engine::registry::Registry;
//! use llama_engine::sampling::SamplingConfig;
//!
//! let registry = Registry::<f32>::new(EngineConfig::default()).unwrap();
//! let first = registry.create(SamplingConfig::greedy()).unwrap();
//! let second = registry.create(SamplingConfig::default()).unwrap();
//! assert_eq!((first, second), (1, 2));
//!
//! registry.destroy(first).unwrap();
//! assert!(registry.query_status(first).is_err());
//! assert_eq!(registry.len(), 1);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ModelConfig};
use crate::numeric::Scalar;
use crate::profiling::GenerationStats;
use crate::sampling::SamplingConfig;
use crate::session::{lock, BusyGuard, ResponseChunk, Session, SessionHandle, StatusReport};
use crate::tokenizer::Tokenizer;
use crate::{Error, Result};

/// Outcome of a destroy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Session quiesced and was released.
    Released,

    /// Session stayed busy past the teardown ceiling and was retained.
    Abandoned,
}

/// A session found by [`Registry::lookup`], optionally holding its busy
/// flag.
#[derive(Debug)]
pub struct Lease<T> {
    session: Arc<Session<T>>,
    guard: Option<BusyGuard>,
}

impl<T> Lease<T> {
    /// The session.
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Check if the lease holds the busy flag.
    pub const fn is_busy(&self) -> bool {
        self.guard.is_some()
    }

    /// Split into the session and its busy guard.
    pub fn into_parts(self) -> (Arc<Session<T>>, Option<BusyGuard>) {
        (self.session, self.guard)
    }
}

/// Handle map for one precision.
pub struct Registry<T> {
    config: Arc<EngineConfig>,
    sessions: Mutex<HashMap<SessionHandle, Arc<Session<T>>>>,
    abandoned: Mutex<Vec<Arc<Session<T>>>>,
    next_handle: AtomicU64,
    shut_down: AtomicBool,
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sessions", &lock(&self.sessions).len())
            .field("abandoned", &lock(&self.abandoned).len())
            .field("next_handle", &self.next_handle.load(Ordering::Relaxed))
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Scalar> Registry<T> {
    /// Create an empty registry.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            sessions: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Engine policy shared by every session.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::not_initialized(format!(
                "{} registry is shut down",
                T::PRECISION
            )));
        }
        Ok(())
    }

    /// Create a session and return its handle.
    ///
    /// A session that fails to construct is never registered.
    pub fn create(&self, sampling: SamplingConfig) -> Result<SessionHandle> {
        self.ensure_running()?;
        sampling.validate()?;

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let session = Session::new(handle, sampling, Arc::clone(&self.config))?;
        lock(&self.sessions).insert(handle, Arc::new(session));

        info!(
            handle,
            precision = %T::PRECISION,
            temperature = sampling.temperature,
            top_p = sampling.top_p,
            seed = sampling.seed,
            "session created"
        );
        Ok(handle)
    }

    /// Find a session, claiming its busy flag when `set_busy` is true.
    pub fn lookup(&self, handle: SessionHandle, set_busy: bool) -> Result<Lease<T>> {
        self.ensure_running()?;
        let sessions = lock(&self.sessions);
        let session = sessions
            .get(&handle)
            .ok_or_else(|| Error::invalid_handle(format!("no session {handle}")))?;
        let guard = if set_busy {
            Some(session.try_acquire()?)
        } else {
            None
        };
        Ok(Lease {
            session: Arc::clone(session),
            guard,
        })
    }

    fn claim(&self, handle: SessionHandle) -> Result<(Arc<Session<T>>, BusyGuard)> {
        let (session, guard) = self.lookup(handle, true)?.into_parts();
        let guard = guard.ok_or_else(|| Error::internal("busy lookup returned no guard"))?;
        Ok((session, guard))
    }

    /// Load a checkpoint into a session.
    pub fn load(&self, handle: SessionHandle, path: impl AsRef<Path>) -> Result<ModelConfig> {
        let (session, guard) = self.claim(handle)?;
        session.load(guard, path.as_ref())
    }

    /// Load a checkpoint with an explicit tokenizer.
    pub fn load_with(
        &self,
        handle: SessionHandle,
        path: impl AsRef<Path>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<ModelConfig> {
        let (session, guard) = self.claim(handle)?;
        session.load_with(guard, path.as_ref(), tokenizer)
    }

    /// Start generation in the background.
    pub fn generate(&self, handle: SessionHandle, prompt: &str) -> Result<()> {
        let (session, guard) = self.claim(handle)?;
        session.generate(guard, prompt)?;
        info!(handle, prompt_bytes = prompt.len(), "generation started");
        Ok(())
    }

    /// Request cancellation without waiting for it.
    pub fn abort(&self, handle: SessionHandle) -> Result<()> {
        let lease = self.lookup(handle, false)?;
        lease.session().cancel();
        debug!(handle, "abort requested");
        Ok(())
    }

    /// Progress and state; never waits on a running operation.
    pub fn query_status(&self, handle: SessionHandle) -> Result<StatusReport> {
        Ok(self.lookup(handle, false)?.session().status())
    }

    /// Next chunk of streamed output.
    pub fn query_response(&self, handle: SessionHandle, max_len: usize) -> Result<ResponseChunk> {
        self.lookup(handle, false)?.session().read_response(max_len)
    }

    /// Next chunk of streamed output, handed to `deliver` before the read
    /// cursor moves.
    pub fn query_response_with<R>(
        &self,
        handle: SessionHandle,
        max_len: usize,
        deliver: impl FnOnce(&str, bool) -> Result<R>,
    ) -> Result<R> {
        self.lookup(handle, false)?
            .session()
            .read_response_with(max_len, deliver)
    }

    /// Statistics of the current or last generation.
    pub fn stats(&self, handle: SessionHandle) -> Result<Option<GenerationStats>> {
        Ok(self.lookup(handle, false)?.session().stats())
    }

    /// Unlink and tear down a session.
    ///
    /// Blocks for at most [`EngineConfig::teardown_ceiling`]. The handle is
    /// invalid as soon as this is called, whatever the outcome.
    pub fn destroy(&self, handle: SessionHandle) -> Result<Teardown> {
        self.ensure_running()?;
        let session = lock(&self.sessions)
            .remove(&handle)
            .ok_or_else(|| Error::invalid_handle(format!("no session {handle}")))?;
        session.cancel();
        Ok(self.teardown(session))
    }

    fn teardown(&self, session: Arc<Session<T>>) -> Teardown {
        let handle = session.handle();
        let interval = self.config.teardown_poll_interval();
        let mut attempts = 0;

        while session.is_busy() {
            if attempts >= self.config.teardown_max_attempts {
                warn!(
                    handle,
                    attempts,
                    waited_ms = self.config.teardown_ceiling().as_millis() as u64,
                    "session still busy, abandoning"
                );
                lock(&self.abandoned).push(session);
                return Teardown::Abandoned;
            }
            thread::sleep(interval);
            attempts += 1;
        }

        session.join_worker();
        debug!(handle, attempts, "session released");
        Teardown::Released
    }

    /// Release abandoned sessions that have since gone idle.
    ///
    /// Returns how many were released.
    pub fn reap(&self) -> usize {
        let idle: Vec<_> = {
            let mut abandoned = lock(&self.abandoned);
            let (idle, busy) = abandoned.drain(..).partition(|s| !s.is_busy());
            *abandoned = busy;
            idle
        };

        for session in &idle {
            session.join_worker();
            debug!(handle = session.handle(), "abandoned session reaped");
        }
        idle.len()
    }

    /// Sessions retained after a timed-out teardown.
    pub fn abandoned_count(&self) -> usize {
        lock(&self.abandoned).len()
    }

    /// Live sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Check if no sessions are live.
    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Live handles in ascending order.
    pub fn handles(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<_> = lock(&self.sessions).keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Destroy every session, reap, and refuse further operations.
    ///
    /// Returns how many sessions were abandoned.
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::Release);
        let drained: Vec<_> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.cancel();
        }
        for session in drained {
            self.teardown(session);
        }
        self.reap();
        let abandoned = self.abandoned_count();
        info!(precision = %T::PRECISION, abandoned, "registry shut down");
        abandoned
    }

    /// Check if [`Registry::shutdown`] ran.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
