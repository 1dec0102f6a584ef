//! Retry backoff policies for the recovery scheduler

use std::time::Duration;

use crate::config::BackoffConfig;

/// Chooses the interval until the next scheduler attempt on a transaction.
pub trait BackoffPolicy: Send + Sync {
    /// `current` is the interval used for the previous attempt;
    /// `progressed` tells whether that attempt moved the transaction forward.
    fn next_interval(&self, current: Duration, progressed: bool) -> Duration;
}

/// Always the same interval
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    pub interval: Duration,
}

impl BackoffPolicy for FixedBackoff {
    fn next_interval(&self, _current: Duration, _progressed: bool) -> Duration {
        self.interval
    }
}

/// Doubles on every stalled attempt up to `max`, resets on progress
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_interval(&self, current: Duration, progressed: bool) -> Duration {
        if progressed || current.is_zero() {
            return self.initial;
        }
        current.saturating_mul(2).min(self.max).max(self.initial)
    }
}

/// Build the policy selected in configuration
pub fn from_config(config: &BackoffConfig) -> Box<dyn BackoffPolicy> {
    match *config {
        BackoffConfig::Fixed { interval_secs } => Box::new(FixedBackoff {
            interval: Duration::from_secs(interval_secs),
        }),
        BackoffConfig::Exponential {
            initial_secs,
            max_secs,
        } => Box::new(ExponentialBackoff {
            initial: Duration::from_secs(initial_secs),
            max: Duration::from_secs(max_secs.max(initial_secs)),
        }),
    }
}
