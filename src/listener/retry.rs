//! Reconnect Retry Policies
//!
//! A listener consults its retry policy once per recovery attempt. The
//! default policy backs off exponentially with a little jitter so a fleet of
//! clients does not stampede a broker that just came back.

use std::time::Duration;

use rand::Rng;

/// What to do about the next reconnect attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then try attempt number `attempt` (1-based).
    Proceed { attempt: u32, delay: Duration },
    /// Stop retrying and fail the listener.
    Exhausted,
}

/// Decides whether and when recovery keeps trying.
pub trait RetryPolicy: Send + Sync {
    /// `next_attempt` is 1 for the first reconnect attempt after a loss.
    fn decide(&self, next_attempt: u32) -> RetryDecision;
}

/// Exponential backoff with optional jitter and an optional attempt cap.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between attempts. Values below 1 are clamped to 1.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Jitter as a fraction of the delay, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Give up after this many failed attempts. Unlimited by default.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    fn base_delay(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        // powi overflows to infinity for large exponents; min caps it.
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        scaled.min(self.max_delay.as_secs_f64())
    }
}

impl RetryPolicy for BackoffPolicy {
    fn decide(&self, next_attempt: u32) -> RetryDecision {
        if let Some(max) = self.max_attempts {
            if next_attempt > max {
                return RetryDecision::Exhausted;
            }
        }

        let base = self.base_delay(next_attempt);
        let delay = if self.jitter <= f64::EPSILON {
            base
        } else {
            let spread = base * self.jitter;
            let sampled = rand::thread_rng().gen_range(base - spread..=base + spread);
            sampled.clamp(0.0, self.max_delay.as_secs_f64())
        };

        RetryDecision::Proceed {
            attempt: next_attempt,
            delay: Duration::from_secs_f64(delay),
        }
    }
}
