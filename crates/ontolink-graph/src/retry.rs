//! Bounded retry with fixed backoff for transient store writes.

use std::future::Future;
use std::time::Duration;

use crate::error::GraphError;

/// Fixed-delay retry policy. Small attempt counts only: the caller
/// surfaces the failure fatally for that write once attempts run out.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Run `operation` up to `config.attempts` times, sleeping the fixed delay
/// between attempts. Only transient errors are retried; typed errors such
/// as a missing key property surface immediately.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, GraphError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GraphError>>,
{
    let attempts = config.attempts.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() => {
                tracing::warn!(attempt = attempt + 1, %error, "transient store write failure");
                last_error = Some(error);
                if attempt + 1 < attempts {
                    tokio::time::sleep(config.delay).await;
                }
            }
            Err(error) => return Err(error),
        }
    }
    Err(GraphError::RetriesExhausted {
        attempts,
        source: Box::new(last_error.unwrap_or_else(|| GraphError::Store("no attempts".into()))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default().with_delay(Duration::from_millis(1));
        let result = with_retry(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GraphError::Store("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default().with_delay(Duration::from_millis(1));
        let result: Result<(), _> = with_retry(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GraphError::MissingKeyProperty {
                    entity_type: "User".into(),
                    property: "id".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(GraphError::MissingKeyProperty { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let config = RetryConfig::default()
            .with_attempts(2)
            .with_delay(Duration::from_millis(1));
        let result: Result<(), _> =
            with_retry(&config, || async { Err(GraphError::Store("down".into())) }).await;
        match result {
            Err(GraphError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
