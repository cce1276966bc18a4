//! retry.rs
//!
//! Fixed-backoff retry for idempotent (GET-style) calls. Mutating calls never go
//! through here: a replayed PUT could clobber a concurrent writer.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    pub const fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    pub async fn run<T, E, F, Fut>(&self, label: &str, retryable: fn(&E) -> bool, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut remaining = self.retries;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if remaining > 0 && retryable(&e) => {
                    remaining -= 1;
                    warn!(call = label, error = %e, remaining, "retrying after transient failure");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestErr {
        Transient,
        Fatal,
    }

    impl std::fmt::Display for TestErr {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn transient(e: &TestErr) -> bool {
        matches!(e, TestErr::Transient)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_budget() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(2, Duration::from_secs(1));
        let res: Result<(), TestErr> = policy
            .run("t", transient, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestErr::Transient)
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res: Result<(), TestErr> = RetryPolicy::new(2, Duration::from_secs(1))
            .run("t", transient, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestErr::Fatal)
            })
            .await;
        assert!(matches!(res, Err(TestErr::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_one_retry() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res = RetryPolicy::new(2, Duration::from_secs(1))
            .run("t", transient, move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestErr::Transient)
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(res.unwrap(), 7);
    }
}
