//! Caller-side retry for transient connection failures.
//!
//! The registry never retries creation on its own; a failed `get_handle` goes
//! straight back to the caller. Callers that want another attempt wrap the
//! call in [`with_retry`] (or use [`get_handle_with_retry`]), which retries
//! only errors that [`ServerError::is_transient`] accepts.

use crate::database::{ConnectionHandle, ConnectionRegistry};
use crate::error::ServerError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy for caller-side retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Spread delays by +/- 25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Same policy with a different attempt budget (minimum 1).
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Load the retry policy from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MYSQL_RETRY_MAX_ATTEMPTS`: Total attempts (default: 3)
    /// - `MYSQL_RETRY_INITIAL_DELAY_MS`: First delay in milliseconds (default: 500)
    /// - `MYSQL_RETRY_MAX_DELAY_MS`: Delay cap in milliseconds (default: 30000)
    /// - `MYSQL_RETRY_MULTIPLIER`: Backoff multiplier (default: 2.0)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse::<u32>("MYSQL_RETRY_MAX_ATTEMPTS") {
            config.max_attempts = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("MYSQL_RETRY_INITIAL_DELAY_MS") {
            config.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("MYSQL_RETRY_MAX_DELAY_MS") {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = env_parse::<f64>("MYSQL_RETRY_MULTIPLIER") {
            config.multiplier = m;
        }

        config
    }

    /// Delay before attempt `attempt` (0-indexed). The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter {
            capped_ms * (0.75 + jitter_fraction() * 0.5)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Value in `[0, 1)` taken from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    f64::from(nanos) / 1_000_000_000.0
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryResult<T> {
    pub value: Option<T>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_error: Option<ServerError>,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    pub fn into_result(self) -> Result<T, ServerError> {
        match self.value {
            Some(v) => Ok(v),
            None => Err(self
                .last_error
                .unwrap_or_else(|| ServerError::internal("retry loop ended without an error"))),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, operation: F) -> RetryResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ServerError>>,
{
    let start = Instant::now();
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt);
            debug!(attempt = attempt + 1, ?delay, "retrying");
            sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                return RetryResult {
                    value: Some(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                    last_error: None,
                };
            }
            Err(e) if !e.is_transient() => {
                debug!("not retrying permanent error: {}", e);
                return RetryResult {
                    value: None,
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                    last_error: Some(e),
                };
            }
            Err(e) => {
                warn!("Attempt {}/{} failed: {}", attempt + 1, attempts, e);
                last_error = Some(e);
            }
        }
    }

    RetryResult {
        value: None,
        attempts,
        elapsed: start.elapsed(),
        last_error,
    }
}

/// [`retry_async`] collapsed to a plain `Result`.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, ServerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ServerError>>,
{
    retry_async(config, operation).await.into_result()
}

/// `registry.get_handle(name)` with caller-side retries.
pub async fn get_handle_with_retry(
    registry: &ConnectionRegistry,
    name: Option<&str>,
    config: &RetryConfig,
) -> Result<Arc<ConnectionHandle>, ServerError> {
    with_retry(config, || registry.get_handle(name)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(8), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::default()
        };
        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_with_attempts_has_floor() {
        assert_eq!(RetryConfig::default().with_attempts(0).max_attempts, 1);
        assert_eq!(RetryConfig::default().with_attempts(4).max_attempts, 4);
        assert_eq!(RetryConfig::no_retry().max_attempts, 1);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("MYSQL_RETRY_MAX_ATTEMPTS", "7");
        std::env::set_var("MYSQL_RETRY_INITIAL_DELAY_MS", "50");
        std::env::set_var("MYSQL_RETRY_MULTIPLIER", "not-a-number");

        let config = RetryConfig::from_env();
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.initial_delay, Duration::from_millis(50));
        assert_eq!(config.multiplier, 2.0);

        std::env::remove_var("MYSQL_RETRY_MAX_ATTEMPTS");
        std::env::remove_var("MYSQL_RETRY_INITIAL_DELAY_MS");
        std::env::remove_var("MYSQL_RETRY_MULTIPLIER");
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_async(&fast(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ServerError::connection("Lost connection to MySQL server"))
            } else {
                Ok("connected")
            }
        })
        .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), "connected");
    }

    #[tokio::test]
    async fn test_permanent_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ServerError::auth("Access denied for user 'root'"))
        })
        .await;

        assert!(matches!(result, Err(ServerError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: RetryResult<()> = retry_async(&fast(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(ServerError::timeout(format!("connect #{n}"), 1))
        })
        .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 3);
        assert!(result
            .last_error
            .unwrap()
            .to_string()
            .contains("connect #2"));
    }
}
