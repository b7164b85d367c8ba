//! Backoff helpers
//!
//! [`calculate_backoff`] drives requeue delays of the controller error
//! policy. [`retry_on_conflict`] wraps read-modify-write status updates that
//! may lose an optimistic-concurrency race.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Requeue delay for the given attempt: `base * 2^attempt`, capped at `max`
///
/// Defaults to 15 seconds base and 5 minutes cap.
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(15);
    let max = max_delay_secs.unwrap_or(300);

    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay_secs.min(max))
}

/// Settings for conflict retries on status writes
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Run `operation` again while it fails with HTTP 409
///
/// Each attempt must re-read the object it is about to write. Any other
/// error, or exhausting `max_attempts`, returns the last error.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &ConflictRetry,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() && attempt < config.max_attempts.max(1) => {
                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                debug!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = jittered.as_millis() as u64,
                    "Conflict, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay = (delay * 2).min(config.max_delay);
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(operation = %operation_name, attempt, "Giving up after repeated conflicts");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    fn fast() -> ConflictRetry {
        ConflictRetry {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, None, None), Duration::from_secs(15));
        assert_eq!(calculate_backoff(1, None, None), Duration::from_secs(30));
        assert_eq!(calculate_backoff(4, None, None), Duration::from_secs(240));
        // capped at 300 s
        assert_eq!(calculate_backoff(5, None, None), Duration::from_secs(300));
        assert_eq!(calculate_backoff(10, None, None), Duration::from_secs(300));
        assert_eq!(calculate_backoff(2, Some(1), Some(3)), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(&fast(), "status", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(conflict())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&fast(), "status", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::ConfigError("bad".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&fast(), "status", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
