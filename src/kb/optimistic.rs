//! optimistic.rs
//!
//! Local state that is updated before the remote call it mirrors and put back
//! to its snapshot when that call fails.

use std::future::Future;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Optimistic<T> {
    value: Mutex<T>,
}

impl<T: Clone> Optimistic<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> T {
        self.lock().clone()
    }

    /// Overwrites the local value, e.g. with what the server confirmed.
    pub fn set(&self, value: T) {
        *self.lock() = value;
    }

    /// Applies `apply` immediately, then runs `op`. On error the value is
    /// reverted to the snapshot taken before `apply`.
    pub async fn mutate<A, F, Fut, R, E>(&self, apply: A, op: F) -> Result<R, E>
    where
        A: FnOnce(&mut T),
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let snapshot = {
            let mut value = self.lock();
            let snapshot = value.clone();
            apply(&mut *value);
            snapshot
        };
        match op().await {
            Ok(out) => Ok(out),
            Err(e) => {
                *self.lock() = snapshot;
                Err(e)
            }
        }
    }
}
