use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid activity data for user {user_id}: {reason}")]
    Input { user_id: String, reason: String },

    #[error("{service} unavailable: {reason}")]
    DependencyUnavailable { service: &'static str, reason: String },

    #[error("{service} timed out after {}ms", after.as_millis())]
    Timeout { service: &'static str, after: Duration },

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("malformed row in {table}: {reason}")]
    MalformedRow { table: &'static str, reason: String },
}

impl PipelineError {
    pub fn input(user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::Input {
            user_id: user_id.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(service: &'static str, reason: impl ToString) -> Self {
        PipelineError::DependencyUnavailable {
            service,
            reason: reason.to_string(),
        }
    }

    pub fn malformed(table: &'static str, reason: impl ToString) -> Self {
        PipelineError::MalformedRow {
            table,
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::DependencyUnavailable { .. })
    }
}

/// Runs `op`, and if it fails with a retryable error waits `backoff` and runs it once more.
pub async fn retry_once<T, F, Fut>(
    label: &str,
    backoff: Duration,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    match op().await {
        Err(err) if err.is_retryable() => {
            warn!(operation = label, error = %err, "retrying after backoff");
            tokio::time::sleep(backoff).await;
            op().await
        }
        other => other,
    }
}

pub async fn with_timeout<T, Fut>(
    service: &'static str,
    budget: Duration,
    fut: Fut,
) -> Result<T, PipelineError>
where
    Fut: Future<Output = Result<T, PipelineError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            service,
            after: budget,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_unavailable_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), PipelineError> = retry_once("test", Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::unavailable("activity store", "down")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_attempt_can_succeed() {
        let calls = AtomicUsize::new(0);
        let result = retry_once("test", Duration::from_millis(1), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(PipelineError::unavailable("activity store", "blip"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn input_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), PipelineError> = retry_once("test", Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::input("u1", "bad row")) }
        })
        .await;

        assert!(matches!(result, Err(PipelineError::Input { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_rows_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), PipelineError> = retry_once("test", Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::malformed("engagement.users", "plan is NULL")) }
        })
        .await;

        assert!(matches!(result, Err(PipelineError::MalformedRow { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_timeout_variant() {
        let result: Result<(), PipelineError> =
            with_timeout("narrative service", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Timeout { .. })));
    }
}
