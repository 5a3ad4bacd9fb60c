use std::time::Duration;

use rand::Rng;

/// Base delays of the exponential backoff sequence, in seconds, before jitter is applied:
/// 1, 2, 4, 8, capped at 10 for every further attempt.
const BASE_SECS: [u64; 5] = [1, 2, 4, 8, 10];
const MAX_BASE_SECS: u64 = 10;

/// Exponential backoff with ±10% jitter, reset on a successful connection.
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { attempt: 0 }
    }

    fn base_secs(&self) -> u64 {
        let idx = self.attempt as usize;
        BASE_SECS.get(idx).copied().unwrap_or(MAX_BASE_SECS)
    }

    /// Returns the next delay and advances the attempt counter.
    pub fn next(&mut self) -> Duration {
        let base = self.base_secs();
        self.attempt += 1;
        jittered(base)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

fn jittered(base_secs: u64) -> Duration {
    let base = base_secs as f64;
    let jitter_frac = rand::rng().random_range(-0.1..=0.1);
    let secs = (base * (1.0 + jitter_frac)).max(0.0);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_matches_spec_with_jitter_bounds() {
        let mut backoff = Backoff::new();
        let expected_bases = [1u64, 2, 4, 8, 10, 10, 10];

        for base in expected_bases {
            let delay = backoff.next();
            let lower = (base as f64) * 0.9;
            let upper = (base as f64) * 1.1;
            let secs = delay.as_secs_f64();
            assert!(
                secs >= lower - 1e-6 && secs <= upper + 1e-6,
                "delay {secs} out of bounds [{lower}, {upper}] for base {base}"
            );
        }
    }

    #[test]
    fn reset_restores_sequence_start() {
        let mut backoff = Backoff::new();
        backoff.next();
        backoff.next();
        backoff.next();
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);

        let delay = backoff.next();
        let secs = delay.as_secs_f64();
        assert!(secs >= 0.9 && secs <= 1.1);
    }
}
