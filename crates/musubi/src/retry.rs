//! Retry loop around storage writes.

use musubi_core::{Result, RetryPolicy};
use std::future::Future;
use tracing::warn;

/// Runs fallible operations under a [`RetryPolicy`].
///
/// Only errors for which [`EngineError::is_retryable`](musubi_core::EngineError::is_retryable)
/// holds are retried; any other error is returned at once.
#[derive(Debug, Clone, Copy)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    /// Creates a retrier for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, fails permanently, or the policy is exhausted.
    ///
    /// `what` names the operation in logs.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.policy.max_retries();
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let delay = self.policy.next_delay();
                    warn!(
                        operation = what,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying ({}/{})",
                        what,
                        attempt + 1,
                        max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(operation = what, error = %e, "{} failed after {} retries", what, attempt);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Splits `items` into chunks of at most `chunk_size` and runs `op` on
    /// each chunk under the policy.
    ///
    /// Every chunk is attempted. Returns, per chunk that exhausted its
    /// attempts, the chunk's items and the last error.
    pub async fn run_chunked<I, F, Fut>(
        &self,
        what: &str,
        items: &[I],
        chunk_size: usize,
        mut op: F,
    ) -> Vec<(Vec<I>, musubi_core::EngineError)>
    where
        I: Clone,
        F: FnMut(Vec<I>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut failed = Vec::new();
        for chunk in items.chunks(chunk_size.max(1)) {
            if let Err(e) = self.run(what, || op(chunk.to_vec())).await {
                failed.push((chunk.to_vec(), e));
            }
        }
        failed
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use musubi_core::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    #[derive(Clone, Default)]
    struct Levels(Arc<Mutex<Vec<Level>>>);

    impl<S: Subscriber> Layer<S> for Levels {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            self.0.lock().expect("levels lock").push(*event.metadata().level());
        }
    }

    fn quick(count: u32) -> Retrier {
        Retrier::new(RetryPolicy::new(count, 5, 20).expect("valid range"))
    }

    #[tokio::test]
    async fn test_at_most_count_plus_one_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<()> = quick(3)
            .run("write", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Storage("unavailable".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(EngineError::Storage(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_sleeps_stay_within_window() {
        let retrier = Retrier::new(RetryPolicy::new(2, 30, 60).expect("valid range"));
        let started = Instant::now();
        let _: Result<()> = retrier
            .run("write", || async { Err(EngineError::Storage("down".into())) })
            .await;
        let elapsed = started.elapsed().as_millis();
        assert!(elapsed >= 60, "two sleeps of at least 30ms, got {elapsed}ms");
        assert!(elapsed < 60 * 2 + 200, "two sleeps of at most 60ms, got {elapsed}ms");
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let value = quick(3)
            .run("write", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::Storage("flaky".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");
        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<()> = quick(5)
            .run("cas", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Conflict("state moved".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_localized_to_its_chunk() {
        let items: Vec<u32> = (0..10).collect();
        let failed = quick(1)
            .run_chunked("bulk", &items, 4, |chunk| async move {
                if chunk.contains(&5) {
                    Err(EngineError::Storage("chunk rejected".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, vec![4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_retries_log_at_warn() {
        let levels = Levels::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(levels.clone()));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        quick(2)
            .run("write", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(EngineError::Storage("flaky".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .expect("second attempt succeeds");
        let levels = levels.0.lock().expect("levels lock").clone();
        assert_eq!(levels, vec![Level::WARN]);
    }
}
