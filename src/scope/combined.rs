//! Combined detection: all three detectors around one body.

use super::{BlockingScope, CatchUnwind, TaskLeakScope, ThreadLeakScope};
use crate::config::CombinedConfig;
use crate::error::CombinedLeakError;
use std::future::Future;

/// All enabled detectors armed over one region.
///
/// Enter order: threads, blocking, tasks. Exit runs every enabled detector
/// even when an earlier one raised, then aggregates the raised errors into
/// one [`CombinedLeakError`] in exit order (threads, blocking, tasks).
#[derive(Debug)]
pub struct CombinedScope {
    threads: Option<ThreadLeakScope>,
    blocking: Option<BlockingScope>,
    tasks: Option<TaskLeakScope>,
}

impl CombinedScope {
    /// Arms every enabled detector.
    ///
    /// # Panics
    ///
    /// Panics when task or blocking detection is enabled and no runtime is
    /// driving the current thread.
    #[must_use]
    pub fn enter(config: CombinedConfig) -> Self {
        let threads = config.threads.map(ThreadLeakScope::enter);
        let blocking = config.blocking.map(BlockingScope::enter);
        let tasks = config.tasks.map(TaskLeakScope::enter);
        Self {
            threads,
            blocking,
            tasks,
        }
    }

    /// Finalizes every enabled detector and aggregates raised findings.
    ///
    /// # Errors
    ///
    /// Returns [`CombinedLeakError`] when at least one detector raised.
    pub async fn close(self) -> Result<(), CombinedLeakError> {
        self.close_internal(false).await
    }

    async fn close_internal(mut self, body_panicked: bool) -> Result<(), CombinedLeakError> {
        let mut errors = Vec::new();
        if let Some(scope) = self.threads.take() {
            if let Err(error) = scope.close_internal(body_panicked) {
                errors.push(error.into());
            }
        }
        if let Some(scope) = self.blocking.take() {
            if let Err(error) = scope.close_internal(body_panicked) {
                errors.push(error.into());
            }
        }
        if let Some(scope) = self.tasks.take() {
            if let Err(error) = scope.close_internal(body_panicked).await {
                errors.push(error.into());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CombinedLeakError { errors })
        }
    }
}

/// Runs `body` with all enabled detectors armed, preserving its return
/// value.
///
/// Every detector finalizes exactly once, including when the body panics
/// (the panic then resumes after finalization and takes priority; findings
/// errors are reported through the log path instead).
///
/// # Errors
///
/// Returns [`CombinedLeakError`] when at least one detector raised.
///
/// # Panics
///
/// Panics when task or blocking detection is enabled outside a runtime,
/// and re-raises body panics.
pub async fn detect_leaks<F, Fut, T>(
    config: CombinedConfig,
    body: F,
) -> Result<T, CombinedLeakError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let scope = CombinedScope::enter(config);
    match CatchUnwind::new(body()).await {
        Ok(value) => scope.close_internal(false).await.map(|()| value),
        Err(payload) => {
            let _ = scope.close_internal(true).await;
            std::panic::resume_unwind(payload);
        }
    }
}
