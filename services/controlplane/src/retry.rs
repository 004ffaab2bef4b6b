// Fixed-interval retry for writes that race with other owners.
use crate::observability::CONFLICT_RETRIES_TOTAL;
use crate::store::StoreResult;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub steps: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            interval: Duration::from_millis(10),
        }
    }
}

/// Run `op` until it succeeds, fails with anything but `Conflict`, or the
/// attempt budget is spent. `op` must re-read the object on every attempt.
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_conflict() && attempt < policy.steps => {
                tracing::debug!(attempt, error = %err, "retrying after conflict");
                metrics::counter!(CONFLICT_RETRIES_TOTAL).increment(1);
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> StoreError {
        StoreError::Conflict {
            kind: "ClusterRole".to_string(),
            name: "cattle-impersonation-u1".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.expect("success"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = retry_on_conflict(RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;
        assert!(result.expect_err("conflict").is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = retry_on_conflict(RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Invalid("bad".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
