//! Bounded worker pool, sized at `clamp(logical_performance_cores - 1, 1, 5)`
//! with panic capture (spec.md §5).
//!
//! Grounded on `server/manager.rs`'s `Semaphore`-gated `tokio::spawn`
//! fan-out: a permit is acquired before spawning, held for the duration
//! of the task, and released on completion (success, error, or panic).

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::error;

use crate::migrate::error::{MigrateError, MigrateResult};

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
        })
    }

    /// `clamp(logical_performance_cores - 1, 1, 5)`, the default sizing
    /// rule from spec.md §5.
    pub fn default_size() -> Arc<Self> {
        let cores = num_cpus::get();
        let size = cores.saturating_sub(1).clamp(1, 5);
        Self::new(size)
    }

    /// Spawn a task, capturing panics into a `MigrateError` rather than
    /// letting them escape the pool; the caller's own error tracker
    /// records the result. Individual failures never cancel siblings.
    pub async fn spawn<F>(&self, future: F) -> MigrateResult<()>
    where
        F: std::future::Future<Output = MigrateResult<()>> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| MigrateError::Other(format!("worker pool closed: {e}")))?;

        let handle = tokio::spawn(async move {
            let _permit = permit;
            future.await
        });

        match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(%join_error, "worker pool task panicked");
                Err(MigrateError::Other(format!("task panicked: {join_error}")))
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_size_is_clamped() {
        let pool = WorkerPool::default_size();
        assert!(pool.available_permits() >= 1 && pool.available_permits() <= 5);
    }

    #[tokio::test]
    async fn panic_is_captured_as_an_error() {
        let pool = WorkerPool::new(2);
        let result = pool
            .spawn(async { panic!("boom") })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failure_in_one_task_does_not_prevent_another() {
        let pool = WorkerPool::new(2);
        let first = pool.spawn(async { Err(MigrateError::Other("x".into())) }).await;
        let second = pool.spawn(async { Ok(()) }).await;
        assert!(first.is_err());
        assert!(second.is_ok());
    }
}
