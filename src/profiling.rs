//! Generation timing.
//!
//! A [`GenerationTimer`] runs alongside one generate call and produces a
//! [`GenerationStats`] snapshot at any point, so status polling can report
//! throughput while the run is still in flight.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::streaming::FinishReason;

/// Throughput counters for one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationStats {
    /// Prompt tokens fed through the model.
    pub prompt_tokens: usize,

    /// Tokens produced by the sampler.
    pub generated_tokens: usize,

    /// Positions the forward pass processed.
    pub positions: usize,

    /// Wall-clock time since the run started.
    pub elapsed: Duration,

    /// Time until the first sampled token.
    pub time_to_first_token: Option<Duration>,

    /// Why the run ended, once it has.
    #[serde(skip)]
    pub finish_reason: Option<FinishReason>,
}

impl GenerationStats {
    /// Forward passes per second over the run.
    pub fn positions_per_second(&self) -> f64 {
        rate(self.positions, self.elapsed)
    }

    /// Sampled tokens per second over the run.
    pub fn tokens_per_second(&self) -> f64 {
        rate(self.generated_tokens, self.elapsed)
    }
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Wall-clock timer for a generation run.
#[derive(Debug)]
pub struct GenerationTimer {
    start: Instant,
    prompt_tokens: usize,
    generated_tokens: usize,
    positions: usize,
    first_token: Option<Duration>,
    finish_reason: Option<FinishReason>,
}

impl GenerationTimer {
    /// Start timing a run over `prompt_tokens` prompt tokens.
    pub fn start(prompt_tokens: usize) -> Self {
        Self {
            start: Instant::now(),
            prompt_tokens,
            generated_tokens: 0,
            positions: 0,
            first_token: None,
            finish_reason: None,
        }
    }

    /// Set the prompt length once it is known.
    pub fn set_prompt_tokens(&mut self, prompt_tokens: usize) {
        self.prompt_tokens = prompt_tokens;
    }

    /// Record one forward pass.
    pub fn record_position(&mut self) {
        self.positions += 1;
    }

    /// Record one sampled token.
    pub fn record_token(&mut self) {
        if self.first_token.is_none() {
            self.first_token = Some(self.start.elapsed());
        }
        self.generated_tokens += 1;
    }

    /// Mark the run finished.
    pub fn finish(&mut self, reason: FinishReason) {
        self.finish_reason = Some(reason);
    }

    /// Elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Current counters.
    pub fn snapshot(&self) -> GenerationStats {
        GenerationStats {
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.generated_tokens,
            positions: self.positions,
            elapsed: self.elapsed(),
            time_to_first_token: self.first_token,
            finish_reason: self.finish_reason,
        }
    }
}
