//! Next-token sampling.
//!
//! Converts a logits vector into a token id.
//!
//! # Key Concepts
//!
//! ## Temperature
//!
//! Controls randomness by scaling logits before softmax:
//! - `T=0`: Deterministic (argmax, ties to the lowest index)
//! - `T=1`: Standard softmax
//! - `T>1`: Flatter distribution
//! - `T<1`: Sharper distribution
//!
//! ## Top-P (Nucleus) Sampling
//!
//! Keep tokens until cumulative probability reaches P:
//! 1. Sort by probability descending
//! 2. Accumulate until the sum first reaches P
//! 3. Zero everything past that point
//! 4. Renormalize and draw
//!
//! `top_p >= 1` keeps the full distribution.
//!
//! ## Reproducibility
//!
//! Each sampler owns a [`StdRng`] seeded from its config. [`Sampler::reseed`]
//! restores the initial stream, so replaying a prompt replays the output.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::numeric::Scalar;
use crate::ops::{argmax, softmax};
use crate::{Error, Result};

/// Configuration for sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for logit scaling (0.0 = deterministic).
    pub temperature: f32,

    /// Top-p (nucleus) sampling threshold (>= 1.0 = disabled).
    pub top_p: f32,

    /// Random seed.
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.9,
            seed: 0,
        }
    }
}

impl SamplingConfig {
    /// Create a config.
    pub const fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_p,
            seed,
        }
    }

    /// Create a greedy (deterministic) config.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            ..Default::default()
        }
    }

    /// Set temperature.
    pub const fn temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    /// Set top-p.
    pub const fn top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    /// Set random seed.
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check if sampling is deterministic.
    pub fn is_deterministic(&self) -> bool {
        self.temperature == 0.0
    }

    /// Check if nucleus filtering is active.
    pub fn uses_nucleus(&self) -> bool {
        self.top_p < 1.0
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::invalid_argument(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 {
            return Err(Error::invalid_argument(format!(
                "top_p must be finite and > 0, got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Token sampler.
///
/// # Examples
///
/// ```rust
/// use llama_engine::sampling::{Sampler, SamplingConfig};
///
/// let mut sampler = Sampler::new(SamplingConfig::greedy()).unwrap();
/// let logits = vec![1.0f32, 2.0, 3.0, 0.5, 0.1];
/// assert_eq!(sampler.sample(&logits).unwrap(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Sampler<T> {
    config: SamplingConfig,
    rng: StdRng,
    probs: Vec<T>,
}

impl<T: Scalar> Sampler<T> {
    /// Create a new sampler.
    pub fn new(config: SamplingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(config.seed),
            probs: Vec::new(),
        })
    }

    /// Get configuration.
    pub const fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Restart the random stream from the configured seed.
    pub fn reseed(&mut self) {
        self.rng = StdRng::seed_from_u64(self.config.seed);
    }

    /// Sample a token from logits.
    pub fn sample(&mut self, logits: &[T]) -> Result<u32> {
        if logits.is_empty() {
            return Err(Error::invalid_argument("cannot sample from empty logits"));
        }

        let idx = if self.config.is_deterministic() {
            argmax(logits).unwrap_or(0)
        } else {
            self.probs.clear();
            self.probs.try_reserve(logits.len())?;
            let temp = T::narrow(f64::from(self.config.temperature));
            self.probs.extend(logits.iter().map(|&l| l / temp));
            softmax(&mut self.probs);

            if self.config.uses_nucleus() {
                nucleus_filter(&mut self.probs, f64::from(self.config.top_p));
            }

            let r: f64 = self.rng.random();
            draw(&self.probs, r)
        };

        u32::try_from(idx).map_err(|_| Error::out_of_bounds(format!("token index {idx} exceeds u32")))
    }
}

/// Truncate `probs` to its nucleus and renormalize in place.
///
/// Keeps the shortest prefix (by descending probability, ties to the lower
/// index) whose cumulative mass first reaches `top_p`. Returns the mass
/// retained before renormalization. `top_p >= 1` is a no-op that returns 1.
///
/// # Examples
///
/// ```rust
/// use llama_engine::sampling::nucleus_filter;
///
/// let mut probs = vec![0.1f64, 0.6, 0.3];
/// let kept = nucleus_filter(&mut probs, 0.8);
/// assert!((kept - 0.9).abs() < 1e-12);
/// assert_eq!(probs[0], 0.0);
/// assert!((probs[1] - 0.6 / 0.9).abs() < 1e-12);
/// ```
pub fn nucleus_filter<T: Scalar>(probs: &mut [T], top_p: f64) -> f64 {
    if top_p >= 1.0 || probs.is_empty() {
        return 1.0;
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));

    let threshold = T::narrow(top_p);
    let mut cumulative = T::zero();
    let mut cutoff = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= threshold {
            cutoff = rank + 1;
            break;
        }
    }

    for &i in &order[cutoff..] {
        probs[i] = T::zero();
    }

    let kept: T = order[..cutoff].iter().map(|&i| probs[i]).sum();
    if kept > T::zero() {
        for p in probs.iter_mut() {
            *p /= kept;
        }
    }
    kept.widen()
}

/// Index selected by `r` in `[0, 1)` from a normalized distribution.
fn draw<T: Scalar>(probs: &[T], r: f64) -> usize {
    let r = T::narrow(r);
    let mut cdf = T::zero();
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if r < cdf {
            return i;
        }
    }

    // Rounding left the total just under r; fall back to the last live entry.
    probs
        .iter()
        .rposition(|&p| p > T::zero())
        .unwrap_or(probs.len() - 1)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_nucleus_mass_bounded_and_renormalized(
            logits in prop::collection::vec(-10.0f64..10.0, 1..64),
            top_p in 0.01f64..1.0,
        ) {
            let mut probs = logits;
            softmax(&mut probs);
            let kept = nucleus_filter(&mut probs, top_p);
            prop_assert!(kept <= 1.0 + 1e-9);
            prop_assert!(kept >= top_p - 1e-9 || (kept - 1.0).abs() < 1e-9);
            let sum: f64 = probs.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-9);
        }

        #[test]
        fn prop_sample_in_range(
            logits in prop::collection::vec(-5.0f32..5.0, 1..100),
            temperature in 0.0f32..2.0,
            top_p in 0.05f32..1.0,
            seed in any::<u64>(),
        ) {
            let mut sampler = Sampler::new(SamplingConfig::new(temperature, top_p, seed)).unwrap();
            let token = sampler.sample(&logits).unwrap();
            prop_assert!((token as usize) < logits.len());
        }

        #[test]
        fn prop_greedy_is_argmax(logits in prop::collection::vec(-5.0f32..5.0, 1..100)) {
            let mut sampler = Sampler::new(SamplingConfig::greedy()).unwrap();
            let token = sampler.sample(&logits).unwrap() as usize;
            prop_assert!(logits.iter().all(|&l| l <= logits[token]));
        }
    }
}
