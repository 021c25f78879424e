//! Traits and types used when defining job logic.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use std::time::Duration;

use super::{current::CurrentJob, error::HandlerError};

#[async_trait]
/// Implemented by the code that performs one [`JobKind`](crate::JobKind).
///
/// A handler may run more than once for the same job (retries, crash
/// recovery), so it must be safe to repeat.
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError>;

    /// Called once after the job's final failed attempt, before it is marked
    /// `FAILED` and while the target is still locked. Also runs when that
    /// attempt timed out or panicked, so `run` cannot do this itself. Undo
    /// side effects that only make sense for a job that goes on.
    async fn abandon(&self, _current_job: &CurrentJob) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[serde_with::serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
/// Retry budget and exponential backoff applied to retryable failures.
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    /// A failure on attempt `max_retries` (or later) is fatal.
    pub max_retries: u32,
    #[serde(default = "default_n_warn_attempts")]
    /// Failures up to this attempt are logged at `WARN`, later ones at `ERROR`.
    /// `None` keeps every retry at `WARN`.
    pub n_warn_attempts: Option<u32>,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(default = "default_base_delay")]
    /// Delay after the first failed attempt; doubled for every further attempt.
    pub base_delay: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(default)]
    /// Percentage (0-100) of the computed delay added as random jitter.
    pub jitter_pct: u8,
}

impl RetrySettings {
    /// Whether a failure on `attempt` exhausts the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt, with jitter applied.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter_pct == 0 || delay.is_zero() {
            return delay;
        }
        let pct = u64::from(self.jitter_pct.min(100));
        let max_jitter_ms = u64::try_from(delay.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(pct)
            / 100;
        let jitter = rand::thread_rng().gen_range(0..=max_jitter_ms);
        delay + Duration::from_millis(jitter)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            n_warn_attempts: default_n_warn_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter_pct: 0,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_n_warn_attempts() -> Option<u32> {
    Some(1)
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    const SECS_IN_ONE_HOUR: u64 = 60 * 60;
    Duration::from_secs(SECS_IN_ONE_HOUR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let settings = RetrySettings::default();
        let delays: Vec<_> = (1..=5).map(|attempt| settings.backoff(attempt)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn backoff_is_capped() {
        let settings = RetrySettings {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(settings.backoff(5), Duration::from_secs(10));
        assert_eq!(settings.backoff(200), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_window() {
        let settings = RetrySettings {
            jitter_pct: 50,
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = settings.next_delay(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn budget_is_exhausted_at_max_retries() {
        let settings = RetrySettings::default();
        assert!(!settings.is_exhausted(1));
        assert!(!settings.is_exhausted(2));
        assert!(settings.is_exhausted(3));
    }
}
