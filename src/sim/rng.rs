//! Random-number port for the simulation
//!
//! Behind a trait so tests can run with a seeded generator and get
//! reproducible movement, battery jitter and spike sequences.

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Randomness used by the simulation models
pub trait Rng: Send {
    /// Uniform sample in `[low, high)`
    fn uniform(&mut self, low: f64, high: f64) -> f64;

    /// Uniform integer sample in `[low, high]`
    fn uniform_int(&mut self, low: i64, high: i64) -> i64;

    /// Normal sample with the given mean and standard deviation
    fn normal(&mut self, mean: f64, std_dev: f64) -> f64;
}

/// Standard generator; seedable for reproducible runs
pub struct SystemRng {
    inner: StdRng,
}

impl SystemRng {
    pub fn new() -> Self {
        Self {
            inner: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for SystemRng {
    fn default() -> Self {
        Self::new()
    }
}

impl Rng for SystemRng {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if low >= high {
            return low;
        }
        self.inner.gen_range(low..high)
    }

    fn uniform_int(&mut self, low: i64, high: i64) -> i64 {
        if low >= high {
            return low;
        }
        self.inner.gen_range(low..=high)
    }

    fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        match Normal::new(mean, std_dev) {
            Ok(distribution) => distribution.sample(&mut self.inner),
            Err(_) => mean,
        }
    }
}
