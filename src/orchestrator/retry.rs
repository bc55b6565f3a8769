use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(5000);

/// Bounded exponential backoff for transient faults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before retry number `retries` (0 = first retry)
    pub fn delay_for(&self, retries: u32) -> Duration {
        let factor = 1u32 << retries.min(20);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, runs out
    /// of attempts or `cancel` fires during a backoff. Returns the outcome and
    /// the number of attempts made.
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        task = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return (Err(e), attempt),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectorError, OrchestrationError, SchemaViolation};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(3200));
        assert_eq!(policy.delay_for(5), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_up_to_the_ceiling() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = fast()
            .run("t", &CancellationToken::new(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ConnectorError::Timeout("slow".into()).into())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_a_transient_failure() {
        let (result, attempts) = fast()
            .run("t", &CancellationToken::new(), |attempt| async move {
                if attempt == 1 {
                    Err(ConnectorError::Timeout("slow".into()).into())
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_schema_violation_is_never_retried() {
        let (result, attempts) = fast()
            .run("t", &CancellationToken::new(), |_| async {
                Err::<(), _>(OrchestrationError::from(SchemaViolation::new("connector:x", "$[0]", "bad")))
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), "schema_violation");
        assert_eq!(attempts, 1);
    }
}
