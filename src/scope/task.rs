//! Task-leak detection scope.

use super::CatchUnwind;
use crate::config::TaskLeakConfig;
use crate::dispatch;
use crate::error::TaskLeakError;
use crate::report::TaskLeakReport;
use crate::runtime::Handle;
use crate::snapshot::TaskSnapshot;
use std::future::Future;

/// Armed task-leak detector over a bounded code region.
///
/// Created by [`TaskLeakScope::enter`] inside a running runtime; finalized
/// exactly once by [`TaskLeakScope::close`]. Tasks spawned between the two
/// calls that are still alive at close are findings.
#[derive(Debug)]
pub struct TaskLeakScope {
    inner: Option<Inner>,
}

#[derive(Debug)]
struct Inner {
    baseline: TaskSnapshot,
    config: TaskLeakConfig,
    runtime: Handle,
}

impl TaskLeakScope {
    /// Arms the detector: captures the baseline snapshot.
    ///
    /// # Panics
    ///
    /// Panics when called outside [`Runtime::block_on`](crate::runtime::Runtime::block_on);
    /// task detection observes the runtime's task table.
    #[must_use]
    pub fn enter(config: TaskLeakConfig) -> Self {
        let runtime = Handle::current();
        if config.track_creation {
            runtime.creation_tracking_enter();
        }
        let baseline = TaskSnapshot::capture(&runtime);
        tracing::debug!(target: crate::TARGET, "task leak scope armed");
        Self {
            inner: Some(Inner {
                baseline,
                config,
                runtime,
            }),
        }
    }

    /// Finalizes the scope: captures the exit snapshot, diffs, filters,
    /// and dispatches findings per the configured action.
    ///
    /// # Errors
    ///
    /// Returns [`TaskLeakError`] only under
    /// [`Action::Raise`](crate::config::Action::Raise) with non-empty
    /// findings.
    pub async fn close(self) -> Result<(), TaskLeakError> {
        self.close_internal(false).await
    }

    pub(crate) async fn close_internal(
        mut self,
        body_panicked: bool,
    ) -> Result<(), TaskLeakError> {
        let inner = self.inner.take().expect("task scope closed twice");
        inner.finalize(body_panicked).await
    }
}

impl Inner {
    async fn finalize(self, body_panicked: bool) -> Result<(), TaskLeakError> {
        if self.config.track_creation {
            self.runtime.creation_tracking_exit();
        }
        tracing::debug!(
            target: crate::TARGET,
            armed_for = ?self.baseline.taken_at().elapsed(),
            "task leak scope finalizing"
        );
        let leaked = self
            .baseline
            .new_alive_since(&self.runtime, self.config.name_filter.as_ref());
        let report = TaskLeakReport { leaked };
        match dispatch::dispatch_tasks(report, &self.config, &self.runtime).await {
            Ok(()) => Ok(()),
            Err(error) if body_panicked => {
                // The body panic takes priority for propagation; the
                // findings still surface, via the log path.
                dispatch::report_fault(self.config.report_sink.as_ref(), &error.to_string());
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

impl Drop for TaskLeakScope {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.config.track_creation {
                inner.runtime.creation_tracking_exit();
            }
            tracing::warn!(
                target: crate::TARGET,
                "task leak scope dropped without close; leak detection skipped"
            );
        }
    }
}

/// Runs `body` inside a task-leak scope, preserving its return value.
///
/// The scope finalizes exactly once, including when the body panics (the
/// panic then resumes after finalization and takes priority over any
/// findings error, which is reported through the log path instead).
///
/// # Errors
///
/// Returns [`TaskLeakError`] only under
/// [`Action::Raise`](crate::config::Action::Raise) with non-empty findings.
///
/// # Panics
///
/// Panics when called outside a runtime, and re-raises body panics.
pub async fn detect_task_leaks<F, Fut, T>(
    config: TaskLeakConfig,
    body: F,
) -> Result<T, TaskLeakError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let scope = TaskLeakScope::enter(config);
    match CatchUnwind::new(body()).await {
        Ok(value) => scope.close_internal(false).await.map(|()| value),
        Err(payload) => {
            let _ = scope.close_internal(true).await;
            std::panic::resume_unwind(payload);
        }
    }
}
