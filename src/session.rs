//! Session lifecycle and background generation.
//!
//! A [`Session`] owns one model, one sampler and the streamed output of its
//! most recent generate call.
//!
//! # Key Concepts
//!
//! ## Lifecycle
//!
//! ```text
//! Created --load--> Loading --> Ready --generate--> Generating --> Completed
//!                      |                                     \--> Cancelled
//!                      \--(error: prior state restored)       \--> Failed
//! ```
//!
//! Terminal states accept another `load` or `generate`.
//!
//! ## Busy Flag
//!
//! Any operation that touches weights or run state holds a [`BusyGuard`].
//! The guard is acquired atomically by the registry lookup, moved into the
//! background worker for `generate`, and released in the same critical
//! section that publishes the operation's final status.
//!
//! Claiming busy also clears any stale cancellation request. A cancel issued
//! after the claim, such as a destroy racing a generate, reaches the worker.
//!
//! ## Polling
//!
//! Status and output live behind a per-session mutex that the worker holds
//! only to append a decoded fragment or update counters. Polls never wait on
//! the forward pass.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ModelConfig};
use crate::numeric::Scalar;
use crate::profiling::{GenerationStats, GenerationTimer};
use crate::sampling::{Sampler, SamplingConfig};
use crate::streaming::{FinishReason, OutputBuffer, Utf8Accumulator, MAX_CHAR_LEN};
use crate::tokenizer::{BpeTokenizer, Tokenizer};
use crate::transformer::Transformer;
use crate::weights::TransformerWeights;
use crate::{Error, Result};

/// Opaque session identifier, positive and never reused.
pub type SessionHandle = u64;

/// Tokenizer file looked up next to a checkpoint.
pub const DEFAULT_TOKENIZER_FILE: &str = "tokenizer.bin";

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no model.
    #[default]
    Created,
    /// Loading a checkpoint.
    Loading,
    /// Model loaded.
    Ready,
    /// Generation in flight.
    Generating,
    /// Generation ran to its step limit or a stop token.
    Completed,
    /// Generation stopped by abort.
    Cancelled,
    /// Generation failed.
    Failed,
}

impl SessionState {
    /// Numeric status code reported by status queries.
    pub const fn code(&self) -> i32 {
        match self {
            Self::Created => 0,
            Self::Loading => 1,
            Self::Ready => 2,
            Self::Generating => 3,
            Self::Completed => 4,
            Self::Cancelled => 5,
            Self::Failed => 6,
        }
    }

    /// Name of the state.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Check if an operation is running.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Loading | Self::Generating)
    }

    /// Check if a generate call has ended.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Percentage of the step budget processed (0..=100).
    pub progress: u32,

    /// Lifecycle state.
    pub state: SessionState,

    /// Positions processed by the current or last run.
    pub position: usize,
}

impl StatusReport {
    /// Numeric status code.
    pub const fn status_code(&self) -> i32 {
        self.state.code()
    }
}

/// Chunk returned by response queries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ResponseChunk {
    /// Newly delivered text.
    pub text: String,

    /// No further text will be produced for this run.
    pub is_end: bool,
}

/// Cooperative cancellation flag shared with the generation worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct StreamState {
    state: SessionState,
    progress: u32,
    position: usize,
    output: OutputBuffer,
    model: Option<ModelConfig>,
    failure: Option<Error>,
    stats: Option<GenerationStats>,
}

impl StreamState {
    fn begin_run(&mut self, state: SessionState) -> SessionState {
        let prior = self.state;
        self.state = state;
        self.progress = 0;
        self.position = 0;
        self.output.clear();
        self.failure = None;
        self.stats = None;
        prior
    }
}

#[derive(Debug, Default)]
struct Shared {
    busy: AtomicBool,
    cancel: CancelToken,
    stream: Mutex<StreamState>,
}

/// Exclusive claim on a session's weights and run state.
///
/// Dropping the guard without [`BusyGuard::finish`] clears busy and, if the
/// session was mid-operation, marks it Failed.
#[derive(Debug)]
pub struct BusyGuard {
    shared: Option<Arc<Shared>>,
}

impl BusyGuard {
    fn shared(&self) -> Option<&Shared> {
        self.shared.as_deref()
    }

    /// Update polled state while holding the claim.
    fn publish<R>(&self, f: impl FnOnce(&mut StreamState) -> R) -> Option<R> {
        self.shared().map(|shared| f(&mut lock(&shared.stream)))
    }

    /// Publish a final update and clear busy in one critical section.
    fn finish(mut self, f: impl FnOnce(&mut StreamState)) {
        if let Some(shared) = self.shared.take() {
            let mut stream = lock(&shared.stream);
            f(&mut stream);
            shared.busy.store(false, Ordering::Release);
        }
    }

    /// Release without changing state.
    pub fn release(self) {
        self.finish(|_| {});
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut stream = lock(&shared.stream);
            if stream.state.is_active() {
                stream.state = SessionState::Failed;
                stream.failure = Some(Error::internal("operation ended without publishing a status"));
            }
            shared.busy.store(false, Ordering::Release);
        }
    }
}

struct LoadedModel<T> {
    transformer: Transformer<T>,
    tokenizer: Arc<dyn Tokenizer>,
}

struct Runtime<T> {
    sampler: Sampler<T>,
    model: Option<LoadedModel<T>>,
}

/// One inference session.
pub struct Session<T> {
    handle: SessionHandle,
    sampling: SamplingConfig,
    config: Arc<EngineConfig>,
    shared: Arc<Shared>,
    runtime: Arc<Mutex<Runtime<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("state", &lock(&self.shared.stream).state)
            .field("busy", &self.shared.busy.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<T: Scalar> Session<T> {
    /// Create an empty session.
    pub fn new(
        handle: SessionHandle,
        sampling: SamplingConfig,
        config: Arc<EngineConfig>,
    ) -> Result<Self> {
        let sampler = Sampler::new(sampling)?;
        Ok(Self {
            handle,
            sampling,
            config,
            shared: Arc::new(Shared::default()),
            runtime: Arc::new(Mutex::new(Runtime {
                sampler,
                model: None,
            })),
            worker: Mutex::new(None),
        })
    }

    /// Session handle.
    pub const fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Sampling parameters fixed at creation.
    pub const fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        lock(&self.shared.stream).state
    }

    /// Check if an operation holds the session.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Claim the session, failing if another operation holds it.
    ///
    /// A successful claim clears cancellation requested before it.
    pub fn try_acquire(&self) -> Result<BusyGuard> {
        self.shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::already_busy(format!("session {}", self.handle)))?;
        self.shared.cancel.reset();
        Ok(BusyGuard {
            shared: Some(Arc::clone(&self.shared)),
        })
    }

    /// Request cancellation of an in-flight generate call.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Dimensions of the loaded model.
    pub fn model_config(&self) -> Option<ModelConfig> {
        lock(&self.shared.stream).model
    }

    /// Progress, state and position.
    pub fn status(&self) -> StatusReport {
        let stream = lock(&self.shared.stream);
        StatusReport {
            progress: stream.progress,
            state: stream.state,
            position: stream.position,
        }
    }

    /// Take up to `max_len` unread bytes of output.
    ///
    /// `max_len` must fit the widest UTF-8 character.
    pub fn read_response(&self, max_len: usize) -> Result<ResponseChunk> {
        self.read_response_with(max_len, |text, is_end| {
            Ok(ResponseChunk {
                text: text.to_owned(),
                is_end,
            })
        })
    }

    /// Hand up to `max_len` unread bytes and the end flag to `deliver`.
    ///
    /// The read cursor advances only if `deliver` succeeds.
    pub fn read_response_with<R>(
        &self,
        max_len: usize,
        deliver: impl FnOnce(&str, bool) -> Result<R>,
    ) -> Result<R> {
        if max_len < MAX_CHAR_LEN {
            return Err(Error::invalid_argument(format!(
                "max_len {max_len} is below {MAX_CHAR_LEN} bytes"
            )));
        }
        let mut stream = lock(&self.shared.stream);
        let chunk = stream.output.peek_chunk(max_len);
        let len = chunk.len();
        let is_end = !stream.state.is_active() && stream.output.unread() == len;
        let delivered = deliver(chunk, is_end)?;
        stream.output.consume(len);
        Ok(delivered)
    }

    /// Statistics of the current or last run.
    pub fn stats(&self) -> Option<GenerationStats> {
        lock(&self.shared.stream).stats
    }

    /// Error that ended the last run early: the failure cause, or
    /// [`Error::Cancelled`] after an abort.
    pub fn failure(&self) -> Option<Error> {
        lock(&self.shared.stream).failure.clone()
    }

    /// Load a checkpoint, resolving the tokenizer from configuration.
    ///
    /// Blocks the calling thread. On failure the previous model and state
    /// are kept.
    pub fn load(&self, guard: BusyGuard, path: &Path) -> Result<ModelConfig> {
        self.load_inner(guard, path, None)
    }

    /// Load a checkpoint with an explicit tokenizer.
    pub fn load_with(
        &self,
        guard: BusyGuard,
        path: &Path,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<ModelConfig> {
        self.load_inner(guard, path, Some(tokenizer))
    }

    fn load_inner(
        &self,
        guard: BusyGuard,
        path: &Path,
        tokenizer: Option<Arc<dyn Tokenizer>>,
    ) -> Result<ModelConfig> {
        let prior = guard
            .publish(|s| std::mem::replace(&mut s.state, SessionState::Loading))
            .unwrap_or_default();
        debug!(handle = self.handle, from = %prior, "loading");

        match self.build_model(path, tokenizer) {
            Ok(model) => {
                let dims = *model.transformer.config();
                let bytes = model.transformer.memory_bytes();
                lock(&self.runtime).model = Some(model);
                guard.finish(|s| {
                    s.begin_run(SessionState::Ready);
                    s.model = Some(dims);
                });
                info!(
                    handle = self.handle,
                    path = %path.display(),
                    dim = dims.dim,
                    layers = dims.n_layers,
                    vocab = dims.vocab_size,
                    seq_len = dims.seq_len,
                    precision = %T::PRECISION,
                    bytes,
                    "model loaded"
                );
                Ok(dims)
            }
            Err(e) => {
                guard.finish(|s| s.state = prior);
                warn!(handle = self.handle, path = %path.display(), error = %e, "load failed");
                Err(e)
            }
        }
    }

    fn build_model(
        &self,
        path: &Path,
        tokenizer: Option<Arc<dyn Tokenizer>>,
    ) -> Result<LoadedModel<T>> {
        let weights = TransformerWeights::<T>::load(path, self.config.use_mmap)?;
        let dims = *weights.config();

        let tokenizer = match tokenizer {
            Some(t) => t,
            None => {
                let tok_path = self.tokenizer_path(path);
                Arc::new(BpeTokenizer::load(&tok_path, dims.vocab_size)?) as Arc<dyn Tokenizer>
            }
        };
        if tokenizer.vocab_size() != dims.vocab_size {
            return Err(Error::load_failure(format!(
                "tokenizer has {} pieces, model vocab is {}",
                tokenizer.vocab_size(),
                dims.vocab_size
            )));
        }

        let transformer = Transformer::new(weights, self.config.rope_theta)?;
        Ok(LoadedModel {
            transformer,
            tokenizer,
        })
    }

    fn tokenizer_path(&self, checkpoint: &Path) -> PathBuf {
        self.config.tokenizer_path.clone().unwrap_or_else(|| {
            checkpoint
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(DEFAULT_TOKENIZER_FILE)
        })
    }

    /// Start generating from `prompt` on a background worker.
    ///
    /// Returns once the worker is running; the guard is released by the
    /// worker when the run ends.
    pub fn generate(&self, guard: BusyGuard, prompt: &str) -> Result<()> {
        if self.model_config().is_none() {
            guard.release();
            return Err(Error::invalid_state(format!(
                "session {} has no model loaded",
                self.handle
            )));
        }

        self.join_worker();
        guard.publish(|s| s.begin_run(SessionState::Generating));
        debug!(handle = self.handle, prompt_bytes = prompt.len(), "generation queued");

        let job = GenerationJob {
            handle: self.handle,
            prompt: prompt.to_owned(),
            config: Arc::clone(&self.config),
            runtime: Arc::clone(&self.runtime),
            cancel: self.shared.cancel.clone(),
            guard,
        };

        let worker = thread::Builder::new()
            .name(format!("llama-gen-{}", self.handle))
            .spawn(move || job.run())
            .map_err(|e| Error::internal(format!("spawn generation worker: {e}")))?;
        *lock(&self.worker) = Some(worker);
        Ok(())
    }

    /// Wait for the last worker thread to exit.
    pub fn join_worker(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(handle = self.handle, "generation worker panicked");
            }
        }
    }
}

struct GenerationJob<T> {
    handle: SessionHandle,
    prompt: String,
    config: Arc<EngineConfig>,
    runtime: Arc<Mutex<Runtime<T>>>,
    cancel: CancelToken,
    guard: BusyGuard,
}

impl<T: Scalar> GenerationJob<T> {
    fn run(self) {
        let Self {
            handle,
            prompt,
            config,
            runtime,
            cancel,
            guard,
        } = self;

        let mut timer = GenerationTimer::start(0);
        let outcome = {
            let mut rt = lock(&runtime);
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                decode_loop(&mut rt, &prompt, &config, &cancel, &guard, &mut timer)
            }))
        };

        let outcome = outcome.unwrap_or_else(|panic| {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::internal(format!("generation panicked: {msg}")))
        });

        let (state, failure) = match outcome {
            Ok(reason) => {
                timer.finish(reason);
                match reason {
                    FinishReason::Cancelled => (
                        SessionState::Cancelled,
                        Some(Error::cancelled(format!(
                            "generation stopped after {} positions",
                            timer.snapshot().positions
                        ))),
                    ),
                    _ => (SessionState::Completed, None),
                }
            }
            Err(e) => {
                timer.finish(FinishReason::Failed);
                (SessionState::Failed, Some(e))
            }
        };
        let stats = timer.snapshot();

        match failure.as_ref().filter(|_| state == SessionState::Failed) {
            None => info!(
                handle,
                state = %state,
                prompt_tokens = stats.prompt_tokens,
                generated = stats.generated_tokens,
                positions = stats.positions,
                tok_per_sec = stats.positions_per_second(),
                "generation finished"
            ),
            Some(e) => warn!(handle, error = %e, positions = stats.positions, "generation failed"),
        }

        guard.finish(|s| {
            s.state = state;
            if state == SessionState::Completed {
                s.progress = 100;
            }
            s.failure = failure;
            s.stats = Some(stats);
        });
    }
}

/// Autoregressive loop; returns why it stopped.
///
/// Prompt tokens are fed to the model in order; once the prompt is
/// exhausted the sampler picks each next token. Every next token is decoded
/// and appended, so the output echoes the prompt after its first token.
fn decode_loop<T: Scalar>(
    rt: &mut Runtime<T>,
    prompt: &str,
    config: &EngineConfig,
    cancel: &CancelToken,
    sink: &BusyGuard,
    timer: &mut GenerationTimer,
) -> Result<FinishReason> {
    let Runtime { sampler, model } = rt;
    let model = model
        .as_mut()
        .ok_or_else(|| Error::invalid_state("no model loaded"))?;
    let LoadedModel {
        transformer,
        tokenizer,
    } = model;

    if cancel.is_cancelled() {
        return Ok(FinishReason::Cancelled);
    }

    let tokens = tokenizer.encode(prompt, config.add_bos)?;
    let Some(&first) = tokens.first() else {
        return Err(Error::invalid_argument("prompt encodes to no tokens"));
    };

    transformer.reset();
    sampler.reseed();
    timer.set_prompt_tokens(tokens.len());

    let steps = config.steps_for(transformer.config());
    let mut utf8 = Utf8Accumulator::new();
    let mut token = first;
    let mut pos = 0;

    let reason = loop {
        if cancel.is_cancelled() {
            break FinishReason::Cancelled;
        }
        if pos >= steps {
            break FinishReason::Length;
        }

        let logits = transformer.forward(token, pos)?;
        timer.record_position();

        let sampled = pos + 1 >= tokens.len();
        let next = if sampled {
            let next = sampler.sample(logits)?;
            timer.record_token();
            next
        } else {
            tokens[pos + 1]
        };
        pos += 1;

        if sampled && config.is_stop_token(next) {
            sink.publish(|s| {
                s.position = pos;
                s.stats = Some(timer.snapshot());
            });
            break FinishReason::EndOfSequence;
        }

        let text = utf8.push(&tokenizer.decode(token, next)?);
        let progress = u32::try_from(100 * pos / steps).unwrap_or(100);
        sink.publish(|s| {
            s.output.push_str(&text);
            s.position = pos;
            s.progress = progress;
            s.stats = Some(timer.snapshot());
        });
        token = next;
    };

    let tail = utf8.finish();
    if !tail.is_empty() {
        sink.publish(|s| s.output.push_str(&tail));
    }
    Ok(reason)
}
