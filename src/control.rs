//! Transport-independent control surface.
//!
//! Hosts address the engine with an operation id, a precision, a small
//! array of numeric arguments and an optional text input. Results come back
//! as a status code plus buffers produced by the host's own allocator.
//!
//! # Key Concepts
//!
//! ## Operation Table
//!
//! | Id | Operation      | Numeric args                | Text input | Numeric output                    | Text output |
//! |----|----------------|-----------------------------|------------|-----------------------------------|-------------|
//! | 1  | create         | `[temperature, top_p, seed]` (optional) | -  | `[handle]`                        | -           |
//! | 2  | destroy        | `[handle]`                  | -          | `[abandoned]`                     | -           |
//! | 3  | load           | `[handle]`                  | path       | `[dim, hidden, layers, heads, kv_heads, vocab, seq_len]` | - |
//! | 4  | query_status   | `[handle]`                  | -          | `[progress, status_code, position]` | -         |
//! | 5  | generate       | `[handle]`                  | prompt     | -                                 | -           |
//! | 6  | query_response | `[handle, max_len]`         | -          | `[is_end]`                        | chunk       |
//! | 7  | abort          | `[handle]`                  | -          | -                                 | -           |
//!
//! ## Host Allocation
//!
//! The engine never hands its own allocations across the boundary. Every
//! output buffer is produced by a [`HostAllocator`]; without one the call
//! fails with `NotInitialized`.

use tracing::debug;

use crate::engine::Engine;
use crate::numeric::{Precision, Scalar};
use crate::registry::{Registry, Teardown};
use crate::sampling::SamplingConfig;
use crate::session::SessionHandle;
use crate::{Error, Result};

/// Status code for success.
pub const STATUS_OK: i32 = 0;

/// Control operation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ControlOp {
    /// Create a session.
    Create = 1,
    /// Destroy a session.
    Destroy = 2,
    /// Load a checkpoint.
    Load = 3,
    /// Read progress and state.
    QueryStatus = 4,
    /// Start generation.
    Generate = 5,
    /// Read streamed output.
    QueryResponse = 6,
    /// Request cancellation.
    Abort = 7,
}

impl ControlOp {
    /// Every operation in id order.
    pub const ALL: [Self; 7] = [
        Self::Create,
        Self::Destroy,
        Self::Load,
        Self::QueryStatus,
        Self::Generate,
        Self::QueryResponse,
        Self::Abort,
    ];

    /// Numeric id.
    pub const fn id(self) -> i32 {
        self as i32
    }

    /// Operation name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::Load => "load",
            Self::QueryStatus => "query_status",
            Self::Generate => "generate",
            Self::QueryResponse => "query_response",
            Self::Abort => "abort",
        }
    }
}

impl TryFrom<i32> for ControlOp {
    type Error = Error;

    fn try_from(id: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.id() == id)
            .ok_or_else(|| Error::unsupported(format!("control operation {id}")))
    }
}

/// Host-side allocation capability.
pub trait HostAllocator {
    /// Host-owned numeric buffer.
    type Numbers;

    /// Host-owned text buffer.
    type Text;

    /// Copy values into a new host buffer; `None` if the host is out of
    /// memory.
    fn numbers(&self, values: &[f64]) -> Option<Self::Numbers>;

    /// Copy text into a new host buffer; `None` if the host is out of
    /// memory.
    fn text(&self, text: &str) -> Option<Self::Text>;
}

/// Allocator for Rust hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct VecAllocator;

impl HostAllocator for VecAllocator {
    type Numbers = Vec<f64>;
    type Text = String;

    fn numbers(&self, values: &[f64]) -> Option<Vec<f64>> {
        Some(values.to_vec())
    }

    fn text(&self, text: &str) -> Option<String> {
        Some(text.to_owned())
    }
}

/// Buffers returned by a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlReply<N, S> {
    /// Numeric output, if the operation has one.
    pub numbers: Option<N>,

    /// Text output, if the operation has one.
    pub text: Option<S>,
}

impl<N, S> ControlReply<N, S> {
    const fn empty() -> Self {
        Self {
            numbers: None,
            text: None,
        }
    }
}

/// Status code for a control result.
pub fn status_of<R>(result: &Result<R>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => e.status_code(),
    }
}

/// Run one control operation.
///
/// # Examples
///
/// ```rust
/// use llama_engine::config::EngineConfig;
/// use llama_engine::control::{invoke, ControlOp, VecAllocator};
/// use llama_engine::engine::Engine;
/// use llama_engine::numeric::Precision;
///
/// let engine = Engine::new(EngineConfig::default()).unwrap();
/// let reply = invoke(&engine, Precision::Single, ControlOp::Create, &[0.0, 1.0, 42.0], None, Some(&VecAllocator)).unwrap();
/// assert_eq!(reply.numbers, Some(vec![1.0]));
///
/// let status = invoke(&engine, Precision::Single, ControlOp::QueryStatus, &[1.0], None, Some(&VecAllocator)).unwrap();
/// assert_eq!(status.numbers, Some(vec![0.0, 0.0, 0.0]));
/// ```
pub fn invoke<A: HostAllocator>(
    engine: &Engine,
    precision: Precision,
    op: ControlOp,
    args: &[f64],
    input: Option<&str>,
    allocator: Option<&A>,
) -> Result<ControlReply<A::Numbers, A::Text>> {
    let allocator =
        allocator.ok_or_else(|| Error::not_initialized("no host allocator registered"))?;
    debug!(op = op.name(), %precision, args = args.len(), "control call");

    match precision {
        Precision::Single => dispatch(engine.single()?, op, args, input, allocator),
        Precision::Double => dispatch(engine.double()?, op, args, input, allocator),
    }
}

/// Run a control operation addressed by raw id.
pub fn invoke_raw<A: HostAllocator>(
    engine: &Engine,
    precision: Precision,
    op: i32,
    args: &[f64],
    input: Option<&str>,
    allocator: Option<&A>,
) -> Result<ControlReply<A::Numbers, A::Text>> {
    invoke(engine, precision, ControlOp::try_from(op)?, args, input, allocator)
}

fn dispatch<T: Scalar, A: HostAllocator>(
    registry: &Registry<T>,
    op: ControlOp,
    args: &[f64],
    input: Option<&str>,
    host: &A,
) -> Result<ControlReply<A::Numbers, A::Text>> {
    let mut reply = ControlReply::empty();

    match op {
        ControlOp::Create => {
            let defaults = SamplingConfig::default();
            let sampling = SamplingConfig::new(
                args.first().map_or(defaults.temperature, |&t| t as f32),
                args.get(1).map_or(defaults.top_p, |&p| p as f32),
                match args.get(2) {
                    Some(&seed) => seed_arg(seed)?,
                    None => defaults.seed,
                },
            );
            let handle = registry.create(sampling)?;
            match numbers(host, &[handle as f64]) {
                Ok(buf) => reply.numbers = Some(buf),
                Err(e) => {
                    // The host never saw the handle.
                    registry.destroy(handle)?;
                    return Err(e);
                }
            }
        }
        ControlOp::Destroy => {
            let teardown = registry.destroy(handle_arg(args)?)?;
            let abandoned = f64::from(u8::from(teardown == Teardown::Abandoned));
            reply.numbers = Some(numbers(host, &[abandoned])?);
        }
        ControlOp::Load => {
            let handle = handle_arg(args)?;
            let path = input.ok_or_else(|| Error::invalid_argument("load needs a path"))?;
            let c = registry.load(handle, path)?;
            let dims = [
                c.dim,
                c.hidden_dim,
                c.n_layers,
                c.n_heads,
                c.n_kv_heads,
                c.vocab_size,
                c.seq_len,
            ]
            .map(|d| d as f64);
            reply.numbers = Some(numbers(host, &dims)?);
        }
        ControlOp::QueryStatus => {
            let status = registry.query_status(handle_arg(args)?)?;
            reply.numbers = Some(numbers(
                host,
                &[
                    f64::from(status.progress),
                    f64::from(status.status_code()),
                    status.position as f64,
                ],
            )?);
        }
        ControlOp::Generate => {
            let handle = handle_arg(args)?;
            let prompt = input.ok_or_else(|| Error::invalid_argument("generate needs a prompt"))?;
            registry.generate(handle, prompt)?;
        }
        ControlOp::QueryResponse => {
            let handle = handle_arg(args)?;
            let max_len = args
                .get(1)
                .copied()
                .ok_or_else(|| Error::invalid_argument("query_response needs max_len"))
                .and_then(count_arg)?;
            let (flag, text) = registry.query_response_with(handle, max_len, |text, is_end| {
                let flag = numbers(host, &[f64::from(u8::from(is_end))])?;
                let text = host
                    .text(text)
                    .ok_or_else(|| Error::out_of_memory("host text buffer"))?;
                Ok((flag, text))
            })?;
            reply.numbers = Some(flag);
            reply.text = Some(text);
        }
        ControlOp::Abort => registry.abort(handle_arg(args)?)?,
    }

    Ok(reply)
}

fn numbers<A: HostAllocator>(host: &A, values: &[f64]) -> Result<A::Numbers> {
    host.numbers(values)
        .ok_or_else(|| Error::out_of_memory("host numeric buffer"))
}

fn is_whole(v: f64) -> bool {
    v.is_finite() && v.fract() == 0.0 && v >= 0.0 && v <= u64::MAX as f64
}

fn handle_arg(args: &[f64]) -> Result<SessionHandle> {
    match args.first() {
        Some(&h) if is_whole(h) && h >= 1.0 => Ok(h as SessionHandle),
        Some(&h) => Err(Error::invalid_handle(format!("{h} is not a session handle"))),
        None => Err(Error::invalid_handle("missing handle argument")),
    }
}

fn count_arg(v: f64) -> Result<usize> {
    if is_whole(v) {
        Ok(v as usize)
    } else {
        Err(Error::invalid_argument(format!("{v} is not a byte count")))
    }
}

/// Any finite value is a seed: truncated toward zero, negatives wrap.
fn seed_arg(v: f64) -> Result<u64> {
    if v.is_finite() {
        Ok(v as i64 as u64)
    } else {
        Err(Error::invalid_argument(format!("{v} is not a seed")))
    }
}
