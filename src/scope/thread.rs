//! Thread-leak detection scope.

use crate::config::ThreadLeakConfig;
use crate::dispatch;
use crate::error::ThreadLeakError;
use crate::report::ThreadLeakReport;
use crate::snapshot::ThreadSnapshot;
use std::panic::AssertUnwindSafe;

/// Armed thread-leak detector over a bounded code region.
///
/// Usable anywhere (no runtime required): it observes the process-wide
/// registry of instrumented threads. Threads spawned between `enter` and
/// `close` that are still alive at close are findings; daemon-marked
/// threads are excluded by default.
#[derive(Debug)]
pub struct ThreadLeakScope {
    inner: Option<Inner>,
}

#[derive(Debug)]
struct Inner {
    baseline: ThreadSnapshot,
    config: ThreadLeakConfig,
}

impl ThreadLeakScope {
    /// Arms the detector: captures the baseline snapshot.
    #[must_use]
    pub fn enter(config: ThreadLeakConfig) -> Self {
        let baseline = ThreadSnapshot::capture();
        tracing::debug!(target: crate::TARGET, "thread leak scope armed");
        Self {
            inner: Some(Inner { baseline, config }),
        }
    }

    /// Finalizes the scope: captures the exit snapshot, diffs, filters,
    /// and dispatches findings per the configured action.
    ///
    /// The scope never joins or kills a leaked thread; it only reports.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadLeakError`] only under
    /// [`Action::Raise`](crate::config::Action::Raise) with non-empty
    /// findings.
    pub fn close(self) -> Result<(), ThreadLeakError> {
        self.close_internal(false)
    }

    pub(crate) fn close_internal(mut self, body_panicked: bool) -> Result<(), ThreadLeakError> {
        let inner = self.inner.take().expect("thread scope closed twice");
        inner.finalize(body_panicked)
    }
}

impl Inner {
    fn finalize(self, body_panicked: bool) -> Result<(), ThreadLeakError> {
        tracing::debug!(
            target: crate::TARGET,
            armed_for = ?self.baseline.taken_at().elapsed(),
            "thread leak scope finalizing"
        );
        let leaked = self
            .baseline
            .new_alive_since(self.config.exclude_daemon, self.config.name_filter.as_ref());
        let report = ThreadLeakReport { leaked };
        match dispatch::dispatch_threads(report, &self.config) {
            Ok(()) => Ok(()),
            Err(error) if body_panicked => {
                dispatch::report_fault(self.config.report_sink.as_ref(), &error.to_string());
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

impl Drop for ThreadLeakScope {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            tracing::warn!(
                target: crate::TARGET,
                "thread leak scope dropped without close; leak detection skipped"
            );
        }
    }
}

/// Runs `body` inside a thread-leak scope, preserving its return value.
///
/// The scope finalizes exactly once, including when the body panics (the
/// panic then resumes after finalization and takes priority over any
/// findings error, which is reported through the log path instead).
///
/// # Errors
///
/// Returns [`ThreadLeakError`] only under
/// [`Action::Raise`](crate::config::Action::Raise) with non-empty findings.
///
/// # Panics
///
/// Re-raises body panics.
pub fn detect_thread_leaks<F, T>(config: ThreadLeakConfig, body: F) -> Result<T, ThreadLeakError>
where
    F: FnOnce() -> T,
{
    let scope = ThreadLeakScope::enter(config);
    match std::panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => scope.close_internal(false).map(|()| value),
        Err(payload) => {
            let _ = scope.close_internal(true);
            std::panic::resume_unwind(payload);
        }
    }
}
