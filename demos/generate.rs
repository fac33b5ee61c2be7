//! Generation Example
//!
//! Drives one session through the full lifecycle: create, load, generate in
//! the background, stream the output by polling, then destroy.
//!
//! # Run
//!
//! ```bash
//! # Synthetic model (random weights, byte-level vocabulary)
//! cargo run --example generate
//!
//! # Real checkpoint; tokenizer.bin is read from the same directory
//! cargo run --release --example generate -- stories15M.bin "Once upon a time"
//! ```

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use llama_engine::config::{EngineConfig, ModelConfig};
use llama_engine::engine::Engine;
use llama_engine::sampling::SamplingConfig;
use llama_engine::session::{SessionState, DEFAULT_TOKENIZER_FILE};
use llama_engine::telemetry::{init_tracing, DEFAULT_DIRECTIVE};
use llama_engine::tokenizer::{BpeTokenizer, Tokenizer};
use llama_engine::weights::{write_checkpoint, TransformerWeights};

fn synthetic_model(dir: &std::path::Path) -> llama_engine::Result<PathBuf> {
    let tokenizer = BpeTokenizer::byte_fallback(&[(" ", 0.0)])?;
    let config = ModelConfig::new(64, 172, 2, 4, tokenizer.vocab_size(), 128);
    let weights = TransformerWeights::<f32>::synthetic(&config, 7)?;

    let path = dir.join("synthetic.bin");
    write_checkpoint(&path, &weights)?;
    std::fs::write(dir.join(DEFAULT_TOKENIZER_FILE), tokenizer.to_bytes())
        .map_err(|e| llama_engine::Error::internal(e.to_string()))?;
    Ok(path)
}

fn main() -> llama_engine::Result<()> {
    init_tracing(DEFAULT_DIRECTIVE);
    println!("=== Generation Demo ===\n");

    let mut args = std::env::args().skip(1);
    let scratch = tempfile::tempdir().map_err(|e| llama_engine::Error::internal(e.to_string()))?;
    let checkpoint = match args.next() {
        Some(path) => PathBuf::from(path),
        None => synthetic_model(scratch.path())?,
    };
    let prompt = args.next().unwrap_or_else(|| "Once upon a time".to_string());

    let engine = Engine::new(EngineConfig::default().max_steps(64))?;
    let registry = engine.single()?;

    let handle = registry.create(SamplingConfig::new(0.8, 0.9, 42))?;
    println!("Session: {handle}");

    let dims = registry.load(handle, &checkpoint)?;
    println!("Model: {}", checkpoint.display());
    println!(
        "  dim={} layers={} heads={}/{} vocab={} seq_len={}",
        dims.dim, dims.n_layers, dims.n_heads, dims.n_kv_heads, dims.vocab_size, dims.seq_len
    );
    println!();

    registry.generate(handle, &prompt)?;
    println!("Output:");

    loop {
        let chunk = registry.query_response(handle, 64)?;
        print!("{}", chunk.text);
        if chunk.is_end {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    println!("\n");

    let status = registry.query_status(handle)?;
    println!("Final state: {} ({}%)", status.state, status.progress);
    if status.state == SessionState::Failed {
        println!("  generation failed; run with RUST_LOG=debug for details");
    }

    if let Some(stats) = registry.stats(handle)? {
        println!("  prompt tokens: {}", stats.prompt_tokens);
        println!("  generated:     {}", stats.generated_tokens);
        println!("  throughput:    {:.1} tok/s", stats.positions_per_second());
    }

    println!("Teardown: {:?}", registry.destroy(handle)?);
    engine.shutdown();
    Ok(())
}
