//! Bounded retry with exponential backoff for calls to external collaborators
//! (advisory service, persistence and sync sinks).

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::{AdvisoryError, PersistenceError};

/// Backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; `0` means a single attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self, section: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.backoff_multiplier < 1.0 {
            errors.push(format!("{section}.backoff_multiplier must be >= 1.0"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            errors.push(format!(
                "{section}.initial_backoff_ms must not exceed max_backoff_ms"
            ));
        }
        errors
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64) as u64;
        let ms = if self.jitter {
            capped + (capped as f64 * 0.25 * rand_simple()) as u64
        } else {
            capped
        };
        Duration::from_millis(ms)
    }
}

/// Errors that can tell whether another attempt may succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for AdvisoryError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            AdvisoryError::Request { .. } | AdvisoryError::Timeout { .. }
        )
    }
}

impl Retryable for PersistenceError {
    fn is_transient(&self) -> bool {
        match self {
            PersistenceError::WriteFailed { .. } | PersistenceError::Timeout { .. } => true,
            // Client errors will not improve on retry.
            PersistenceError::Rejected { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the retry budget
/// is spent. The last error is returned on exhaustion.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }
                let backoff = config.backoff(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Cheap pseudo-random in [0, 1) for jitter.
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = no_jitter();
        assert_eq!(config.backoff(0), Duration::from_millis(10));
        assert_eq!(config.backoff(1), Duration::from_millis(20));
        assert_eq!(config.backoff(2), Duration::from_millis(40));
        assert_eq!(config.backoff(3), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_bounded() {
        let config = RetryConfig {
            jitter: true,
            ..no_jitter()
        };
        let delay = config.backoff(1).as_millis();
        assert!((20..=25).contains(&delay));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&no_jitter(), move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AdvisoryError::Timeout { timeout_ms: 5 })
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&no_jitter(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::WriteFailed {
                sink: "jsonl".into(),
                message: "disk full".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&no_jitter(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::Rejected {
                sink: "http-sync".into(),
                status: 400,
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_validate() {
        let mut config = RetryConfig::default();
        assert!(config.validate("dispatch.retry").is_empty());
        config.backoff_multiplier = 0.5;
        assert_eq!(config.validate("dispatch.retry").len(), 1);
    }
}
