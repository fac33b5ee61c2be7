//! End-to-end scenarios over a synthetic checkpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use llama_engine::config::{EngineConfig, ModelConfig};
use llama_engine::control::{invoke, status_of, ControlOp, VecAllocator};
use llama_engine::engine::Engine;
use llama_engine::numeric::Precision;
use llama_engine::ops::argmax;
use llama_engine::registry::{Registry, Teardown};
use llama_engine::sampling::SamplingConfig;
use llama_engine::session::{SessionHandle, SessionState, StatusReport, DEFAULT_TOKENIZER_FILE};
use llama_engine::streaming::Utf8Accumulator;
use llama_engine::tokenizer::{BpeTokenizer, TokenId, Tokenizer};
use llama_engine::transformer::Transformer;
use llama_engine::weights::{write_checkpoint, TransformerWeights};

const SEQ_LEN: usize = 48;

struct Fixture {
    _dir: tempfile::TempDir,
    checkpoint: PathBuf,
    tokenizer: BpeTokenizer,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer =
        BpeTokenizer::byte_fallback(&[(" ", 0.0), ("e", 0.0), ("l", 0.0), ("ll", 1.0)]).unwrap();
    let config = ModelConfig::new(32, 64, 2, 4, tokenizer.vocab_size(), SEQ_LEN).n_kv_heads(2);
    let weights = TransformerWeights::<f32>::synthetic(&config, 1234).unwrap();

    let checkpoint = dir.path().join("model.bin");
    write_checkpoint(&checkpoint, &weights).unwrap();
    std::fs::write(dir.path().join(DEFAULT_TOKENIZER_FILE), tokenizer.to_bytes()).unwrap();

    Fixture {
        _dir: dir,
        checkpoint,
        tokenizer,
    }
}

/// Tokenizer whose decode takes a fixed time, to keep runs in flight.
struct SlowTokenizer {
    inner: BpeTokenizer,
    delay: Duration,
}

impl Tokenizer for SlowTokenizer {
    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn encode(&self, text: &str, bos: bool) -> llama_engine::Result<Vec<TokenId>> {
        self.inner.encode(text, bos)
    }

    fn decode(&self, prev: TokenId, token: TokenId) -> llama_engine::Result<Vec<u8>> {
        thread::sleep(self.delay);
        self.inner.decode(prev, token)
    }
}

fn slow(fx: &Fixture, delay_ms: u64) -> Arc<dyn Tokenizer> {
    Arc::new(SlowTokenizer {
        inner: fx.tokenizer.clone(),
        delay: Duration::from_millis(delay_ms),
    })
}

fn wait_terminal(registry: &Registry<f32>, handle: SessionHandle) -> StatusReport {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = registry.query_status(handle).unwrap();
        if status.state.is_terminal() && !registry.lookup(handle, false).unwrap().session().is_busy() {
            return status;
        }
        assert!(Instant::now() < deadline, "generation did not finish: {status:?}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn wait_position(registry: &Registry<f32>, handle: SessionHandle, position: usize) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while registry.query_status(handle).unwrap().position < position {
        assert!(Instant::now() < deadline, "generation stalled");
        thread::sleep(Duration::from_millis(1));
    }
}

fn drain(registry: &Registry<f32>, handle: SessionHandle, max_len: usize) -> String {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut out = String::new();
    loop {
        let chunk = registry.query_response(handle, max_len).unwrap();
        assert!(chunk.text.len() <= max_len);
        out.push_str(&chunk.text);
        if chunk.is_end {
            return out;
        }
        assert!(Instant::now() < deadline, "stream never ended");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Greedy continuation computed directly against the forward pass.
fn greedy_reference(path: &Path, tokenizer: &BpeTokenizer, prompt: &str, stop: &[u32]) -> String {
    let weights = TransformerWeights::<f32>::load(path, false).unwrap();
    let mut model = Transformer::new(weights, 10_000.0).unwrap();
    let tokens = tokenizer.encode(prompt, true).unwrap();

    let mut utf8 = Utf8Accumulator::new();
    let mut out = String::new();
    let mut token = tokens[0];
    for pos in 0..SEQ_LEN {
        let logits = model.forward(token, pos).unwrap();
        let sampled = pos + 1 >= tokens.len();
        let next = if sampled {
            argmax(logits).unwrap() as u32
        } else {
            tokens[pos + 1]
        };
        if sampled && stop.contains(&next) {
            break;
        }
        out.push_str(&utf8.push(&tokenizer.decode(token, next).unwrap()));
        token = next;
    }
    out.push_str(&utf8.finish());
    out
}

fn engine(config: EngineConfig) -> Engine {
    Engine::new(config).unwrap()
}

#[test]
fn test_handles_are_monotonic() {
    let engine = engine(EngineConfig::default());
    let reg = engine.single().unwrap();
    assert_eq!(reg.create(SamplingConfig::default()).unwrap(), 1);
    assert_eq!(reg.create(SamplingConfig::default()).unwrap(), 2);
    reg.destroy(1).unwrap();
    assert_eq!(reg.create(SamplingConfig::default()).unwrap(), 3);
}

#[test]
fn test_greedy_generation_streams_reference_output() {
    let fx = fixture();
    let engine = engine(EngineConfig::default());
    let reg = engine.single().unwrap();

    let h = reg.create(SamplingConfig::new(0.0, 1.0, 42)).unwrap();
    assert_eq!(h, 1);
    let dims = reg.load(h, &fx.checkpoint).unwrap();
    assert_eq!(dims.seq_len, SEQ_LEN);
    assert_eq!(reg.query_status(h).unwrap().state, SessionState::Ready);

    reg.generate(h, "Hello").unwrap();
    let status = wait_terminal(reg, h);
    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.status_code(), 4);

    let streamed = drain(reg, h, 256);
    let expected = greedy_reference(&fx.checkpoint, &fx.tokenizer, "Hello", &[1, 2]);
    assert_eq!(streamed, expected);
    assert!(streamed.starts_with("Hello"));

    let stats = reg.stats(h).unwrap().unwrap();
    assert_eq!(stats.positions, status.position);
}

#[test]
fn test_small_reads_reassemble_stream() {
    let fx = fixture();
    let engine = engine(EngineConfig::default().stop_token_ids(vec![]));
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load(h, &fx.checkpoint).unwrap();

    reg.generate(h, "hello").unwrap();
    let streamed = drain(reg, h, 4);
    let expected = greedy_reference(&fx.checkpoint, &fx.tokenizer, "hello", &[]);
    assert_eq!(streamed, expected);
}

#[test]
fn test_multibyte_stream_drains_with_narrow_reads() {
    let fx = fixture();
    let engine = engine(EngineConfig::default().stop_token_ids(vec![]));
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load(h, &fx.checkpoint).unwrap();

    reg.generate(h, "hé中😀").unwrap();
    assert_eq!(reg.query_response(h, 3).unwrap_err().code(), "INVALID_ARGUMENT");
    let streamed = drain(reg, h, 4);
    let expected = greedy_reference(&fx.checkpoint, &fx.tokenizer, "hé中😀", &[]);
    assert_eq!(streamed, expected);
    assert!(streamed.starts_with("hé中😀"));
}

#[test]
fn test_destroy_between_claim_and_start_cancels_run() {
    let fx = fixture();
    let config = EngineConfig::default()
        .stop_token_ids(vec![])
        .teardown_poll_ms(10)
        .teardown_max_attempts(100);
    let engine = engine(config);
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load_with(h, &fx.checkpoint, slow(&fx, 50)).unwrap();

    let (session, guard) = reg.lookup(h, true).unwrap().into_parts();
    let guard = guard.unwrap();

    let outcome = thread::scope(|scope| {
        let teardown = scope.spawn(|| reg.destroy(h));
        let deadline = Instant::now() + Duration::from_secs(10);
        while reg.query_status(h).is_ok() {
            assert!(Instant::now() < deadline, "destroy never unlinked the handle");
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));

        session.generate(guard, "Hello").unwrap();
        teardown.join().unwrap()
    });

    assert_eq!(outcome.unwrap(), Teardown::Released);
    assert_eq!(reg.abandoned_count(), 0);
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(session.failure().unwrap().code(), "CANCELLED");
    assert!(session.status().position < SEQ_LEN);
}

#[test]
fn test_abort_between_claim_and_start_cancels_run() {
    let fx = fixture();
    let engine = engine(EngineConfig::default().stop_token_ids(vec![]));
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load_with(h, &fx.checkpoint, slow(&fx, 50)).unwrap();

    let (session, guard) = reg.lookup(h, true).unwrap().into_parts();
    reg.abort(h).unwrap();
    session.generate(guard.unwrap(), "Hello").unwrap();

    let status = wait_terminal(reg, h);
    assert_eq!(status.state, SessionState::Cancelled);
    assert_eq!(status.position, 0);
    assert_eq!(session.failure().unwrap().code(), "CANCELLED");
}

#[test]
fn test_lookup_after_destroy_is_invalid() {
    let fx = fixture();
    let engine = engine(EngineConfig::default());
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load(h, &fx.checkpoint).unwrap();
    reg.generate(h, "Hello").unwrap();

    reg.destroy(h).unwrap();
    assert_eq!(reg.lookup(h, false).unwrap_err().code(), "INVALID_HANDLE");
    assert_eq!(reg.query_status(h).unwrap_err().code(), "INVALID_HANDLE");
    assert_eq!(reg.query_response(h, 16).unwrap_err().code(), "INVALID_HANDLE");
    assert_eq!(reg.generate(h, "again").unwrap_err().code(), "INVALID_HANDLE");
}

#[test]
fn test_abort_cancels_in_flight_generation() {
    let fx = fixture();
    let engine = engine(EngineConfig::default().stop_token_ids(vec![]));
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load_with(h, &fx.checkpoint, slow(&fx, 5)).unwrap();

    reg.generate(h, "Hello").unwrap();
    wait_position(reg, h, 2);
    reg.abort(h).unwrap();

    let status = wait_terminal(reg, h);
    assert_eq!(status.state, SessionState::Cancelled);
    assert!(status.position < SEQ_LEN);
    assert_eq!(status.status_code(), 5);
    let failure = reg.lookup(h, false).unwrap().session().failure().unwrap();
    assert_eq!(failure.code(), "CANCELLED");

    // Partial output stays readable and the session accepts new work.
    let partial = drain(reg, h, 256);
    assert!(!partial.is_empty());
    reg.generate(h, "Hello").unwrap();
    wait_terminal(reg, h);
}

#[test]
fn test_second_generate_is_rejected_while_running() {
    let fx = fixture();
    let engine = engine(EngineConfig::default().stop_token_ids(vec![]));
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load_with(h, &fx.checkpoint, slow(&fx, 5)).unwrap();

    reg.generate(h, "Hello").unwrap();
    assert_eq!(reg.generate(h, "Hello").unwrap_err().code(), "ALREADY_BUSY");
    assert_eq!(reg.load(h, &fx.checkpoint).unwrap_err().code(), "ALREADY_BUSY");

    reg.abort(h).unwrap();
    wait_terminal(reg, h);
}

#[test]
fn test_polling_does_not_block_on_generation() {
    let fx = fixture();
    let engine = engine(EngineConfig::default().stop_token_ids(vec![]));
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load_with(h, &fx.checkpoint, slow(&fx, 200)).unwrap();

    reg.generate(h, "Hello").unwrap();
    wait_position(reg, h, 1);

    // The worker is inside a 200ms step; polls must not wait for it.
    let started = Instant::now();
    for _ in 0..10 {
        assert_eq!(reg.query_status(h).unwrap().state, SessionState::Generating);
        reg.query_response(h, 8).unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(100));

    reg.abort(h).unwrap();
    wait_terminal(reg, h);
}

#[test]
fn test_destroy_while_running_is_bounded() {
    let fx = fixture();
    let config = EngineConfig::default()
        .stop_token_ids(vec![])
        .teardown_poll_ms(10)
        .teardown_max_attempts(20);
    let ceiling = config.teardown_ceiling();
    let engine = engine(config);
    let reg = engine.single().unwrap();

    let first = reg.create(SamplingConfig::greedy()).unwrap();
    let second = reg.create(SamplingConfig::greedy()).unwrap();
    assert_eq!((first, second), (1, 2));
    reg.load_with(first, &fx.checkpoint, slow(&fx, 5)).unwrap();
    reg.load(second, &fx.checkpoint).unwrap();

    reg.generate(first, "Hello").unwrap();
    wait_position(reg, first, 1);

    let started = Instant::now();
    let outcome = reg.destroy(first).unwrap();
    assert!(started.elapsed() < ceiling + Duration::from_secs(1));
    assert_eq!(outcome, Teardown::Released);
    assert_eq!(reg.abandoned_count(), 0);

    // The neighbour is untouched and still works.
    assert_eq!(reg.query_status(second).unwrap().state, SessionState::Ready);
    reg.generate(second, "Hello").unwrap();
    assert_eq!(wait_terminal(reg, second).state, SessionState::Completed);
    assert_eq!(
        drain(reg, second, 256),
        greedy_reference(&fx.checkpoint, &fx.tokenizer, "Hello", &[1, 2])
    );
}

#[test]
fn test_destroy_timeout_abandons_then_reaps() {
    let fx = fixture();
    let config = EngineConfig::default()
        .stop_token_ids(vec![])
        .teardown_poll_ms(5)
        .teardown_max_attempts(4);
    let engine = engine(config);
    let reg = engine.single().unwrap();

    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load_with(h, &fx.checkpoint, slow(&fx, 300)).unwrap();
    reg.generate(h, "Hello").unwrap();
    wait_position(reg, h, 1);

    let started = Instant::now();
    assert_eq!(reg.destroy(h).unwrap(), Teardown::Abandoned);
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(reg.abandoned_count(), 1);
    assert_eq!(reg.query_status(h).unwrap_err().code(), "INVALID_HANDLE");

    // The worker observes cancellation after its current step.
    let deadline = Instant::now() + Duration::from_secs(10);
    while reg.abandoned_count() > 0 {
        reg.reap();
        assert!(Instant::now() < deadline, "abandoned session never quiesced");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let fx = fixture();
    let engine = engine(EngineConfig::default().stop_token_ids(vec![]));
    let reg = engine.single().unwrap();
    let sampling = SamplingConfig::new(1.0, 1.0, 7);

    let a = reg.create(sampling).unwrap();
    let b = reg.create(sampling).unwrap();
    reg.load(a, &fx.checkpoint).unwrap();
    reg.load(b, &fx.checkpoint).unwrap();

    reg.generate(a, "Hello").unwrap();
    wait_terminal(reg, a);
    let first = drain(reg, a, 1024);

    reg.generate(a, "Hello").unwrap();
    wait_terminal(reg, a);
    let again = drain(reg, a, 1024);

    reg.generate(b, "Hello").unwrap();
    wait_terminal(reg, b);
    let other = drain(reg, b, 1024);

    assert_eq!(first, again);
    assert_eq!(first, other);
}

#[test]
fn test_double_precision_registry() {
    let fx = fixture();
    let engine = engine(EngineConfig::default().max_steps(16));
    let reg = engine.double().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    reg.load(h, &fx.checkpoint).unwrap();
    reg.generate(h, "Hello").unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    while reg.lookup(h, false).unwrap().session().is_busy() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    let status = reg.query_status(h).unwrap();
    assert!(status.state.is_terminal());
    assert!(status.position <= 16);
}

#[test]
fn test_control_surface_lifecycle() {
    let fx = fixture();
    let engine = engine(EngineConfig::default());
    let host = VecAllocator;
    let call = |op, args: &[f64], input: Option<&str>| {
        invoke(&engine, Precision::Single, op, args, input, Some(&host))
    };

    let created = call(ControlOp::Create, &[0.0, 1.0, 42.0], None).unwrap();
    assert_eq!(created.numbers, Some(vec![1.0]));

    let path = fx.checkpoint.to_string_lossy().into_owned();
    let loaded = call(ControlOp::Load, &[1.0], Some(&path)).unwrap();
    let dims = loaded.numbers.unwrap();
    assert_eq!(dims.len(), 7);
    assert_eq!(dims[6], SEQ_LEN as f64);

    call(ControlOp::Generate, &[1.0], Some("Hello")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut streamed = String::new();
    loop {
        let reply = call(ControlOp::QueryResponse, &[1.0, 256.0], None).unwrap();
        streamed.push_str(&reply.text.unwrap());
        if reply.numbers == Some(vec![1.0]) {
            break;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    let status = call(ControlOp::QueryStatus, &[1.0], None).unwrap().numbers.unwrap();
    assert_eq!(status[0], 100.0);
    assert_eq!(status[1], 4.0);
    assert_eq!(
        streamed,
        greedy_reference(&fx.checkpoint, &fx.tokenizer, "Hello", &[1, 2])
    );

    let destroyed = call(ControlOp::Destroy, &[1.0], None).unwrap();
    assert_eq!(destroyed.numbers, Some(vec![0.0]));
    assert_eq!(status_of(&call(ControlOp::QueryStatus, &[1.0], None)), 2);
}

#[test]
fn test_truncated_checkpoint_fails_load() {
    let fx = fixture();
    let bytes = std::fs::read(&fx.checkpoint).unwrap();
    let truncated = fx.checkpoint.with_file_name("truncated.bin");
    std::fs::write(&truncated, &bytes[..bytes.len() - 4]).unwrap();

    let engine = engine(EngineConfig::default());
    let reg = engine.single().unwrap();
    let h = reg.create(SamplingConfig::greedy()).unwrap();
    assert_eq!(reg.load(h, &truncated).unwrap_err().code(), "LOAD_FAILURE");
    assert_eq!(reg.query_status(h).unwrap().state, SessionState::Created);

    reg.load(h, &fx.checkpoint).unwrap();
    assert_eq!(reg.query_status(h).unwrap().state, SessionState::Ready);
}
