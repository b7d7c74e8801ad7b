use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::common::config::deserialize_human_duration;

/// Bounded exponential backoff used for connection attempts.
///
/// The delay before attempt `n + 1` is `initial_delay * factor^(n - 1)`, capped at `max_delay`.
/// At most `max_attempts` attempts are made.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub initial_delay: Duration,
    pub factor: f64,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Runs `operation` until it succeeds, fails with an error that is not retryable or the
    /// attempts are exhausted. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> crate::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    log::warn!(
                        "{what} failed (attempt {attempt}/{max_attempts}): {error}, retrying in {}",
                        humantime::format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::RetryPolicy;
    use crate::Error;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            factor: 3.0,
            max_delay: Duration::from_secs(5),
        }
    }

    fn connection_error() -> Error {
        Error::ConnectionError {
            host: "login".to_string(),
            message: "refused".to_string(),
        }
    }

    #[test]
    fn test_delay_is_bounded() {
        let policy = policy();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(3));
        assert_eq!(policy.delay_after(3), Duration::from_secs(5));
        assert_eq!(policy.delay_after(100), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Cell::new(0);
        let start = tokio::time::Instant::now();
        let result = policy()
            .run("connect", |attempt| {
                calls.set(calls.get() + 1);
                async move {
                    if attempt < 3 {
                        Err(connection_error())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: crate::Result<()> = policy()
            .run("connect", |_| {
                calls.set(calls.get() + 1);
                async { Err(connection_error()) }
            })
            .await;
        assert!(matches!(result, Err(Error::ConnectionError { .. })));
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: crate::Result<()> = policy()
            .run("submit", |_| {
                calls.set(calls.get() + 1);
                async {
                    Err(Error::SubmissionError {
                        message: "rejected".to_string(),
                        stderr: String::new(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
