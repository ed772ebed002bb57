//! Exponential backoff for DEP page requests
//!
//! Only failures that can succeed on a second try are retried: transport
//! errors, HTTP 429 and HTTP 5xx. Terms, cursor and other 4xx answers are
//! returned at once.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Stretch each backoff by up to 25%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt + 1`
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let secs = if self.jitter {
            capped * (1.0 + jitter_fraction() * 0.25)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

/// Pseudo-random fraction in [0, 1) from the clock's sub-second nanos
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

/// Errors that know whether retrying them makes sense
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}

impl RetryableError for depapi::Error {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            depapi::Error::Transport(_) => RetryDecision::Retry,
            depapi::Error::Http { status, .. } if *status == 429 || *status >= 500 => {
                RetryDecision::Retry
            }
            _ => RetryDecision::NoRetry,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// retries. The last error is returned.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if err.retry_decision() == RetryDecision::NoRetry {
            debug!(operation = operation_name, attempt, error = %err, "Not retrying");
            return Err(err);
        }

        if attempt >= config.max_retries {
            warn!(
                operation = operation_name,
                attempts = attempt + 1,
                error = %err,
                "Giving up after retries"
            );
            return Err(err);
        }

        let backoff = config.backoff_duration(attempt);
        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            max_attempts = config.max_retries + 1,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        sleep(backoff).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_duration() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(config.backoff_duration(2), Duration::from_secs(4));
        assert_eq!(config.backoff_duration(5), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(2),
            ..Default::default()
        };
        let backoff = config.backoff_duration(0);
        assert!(backoff >= Duration::from_secs(2));
        assert!(backoff <= Duration::from_millis(2500));
    }

    #[test]
    fn test_dep_error_classification() {
        use depapi::Error;

        assert_eq!(
            Error::Transport("reset".into()).retry_decision(),
            RetryDecision::Retry
        );
        assert_eq!(
            Error::from_response(429, "").retry_decision(),
            RetryDecision::Retry
        );
        assert_eq!(
            Error::from_response(502, "bad gateway").retry_decision(),
            RetryDecision::Retry
        );
        assert_eq!(
            Error::from_response(403, "T_C_NOT_SIGNED").retry_decision(),
            RetryDecision::NoRetry
        );
        assert_eq!(
            Error::from_response(400, "EXPIRED_CURSOR").retry_decision(),
            RetryDecision::NoRetry
        );
        assert_eq!(
            Error::from_response(404, "").retry_decision(),
            RetryDecision::NoRetry
        );
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let mut attempts = 0;
        let result: Result<&str, depapi::Error> = with_retry(&fast(), "fetch_devices", || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err(depapi::Error::from_response(503, ""))
                } else {
                    Ok("page")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "page");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut attempts = 0;
        let result: Result<(), depapi::Error> = with_retry(&fast(), "sync_devices", || {
            attempts += 1;
            async { Err(depapi::Error::Transport("timeout".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let mut attempts = 0;
        let result: Result<(), depapi::Error> = with_retry(&RetryConfig::default(), "fetch", || {
            attempts += 1;
            async { Err(depapi::Error::TermsNotSigned) }
        })
        .await;

        assert!(result.unwrap_err().is_terms_not_signed());
        assert_eq!(attempts, 1);
    }
}
