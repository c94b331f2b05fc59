//! Event-loop blocking detection scope.

use super::CatchUnwind;
use crate::config::{Action, BlockingConfig};
use crate::dispatch;
use crate::error::EventLoopBlockError;
use crate::runtime::Handle;
use crate::watchdog::Watchdog;
use std::future::Future;

/// Armed event-loop responsiveness monitor over a bounded code region.
///
/// Entering spawns the watchdog thread; it probes the loop for the
/// lifetime of the scope and is signaled to stop and joined (bounded) at
/// close. Episodes are dispatched as they are detected for `Warn`, `Log`,
/// and degraded `Cancel`; `Raise` comes out of [`BlockingScope::close`]
/// with the full accumulated list.
#[derive(Debug)]
pub struct BlockingScope {
    inner: Option<Inner>,
}

struct Inner {
    watchdog: Watchdog,
    config: BlockingConfig,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BlockingScope {
    /// Arms the monitor: spawns the watchdog thread against the current
    /// runtime's loop.
    ///
    /// # Panics
    ///
    /// Panics when called outside [`Runtime::block_on`](crate::runtime::Runtime::block_on);
    /// there is no loop to monitor otherwise.
    #[must_use]
    pub fn enter(config: BlockingConfig) -> Self {
        let runtime = Handle::current();
        let watchdog = Watchdog::start(runtime, config.clone());
        tracing::debug!(target: crate::TARGET, "blocking scope armed");
        Self {
            inner: Some(Inner { watchdog, config }),
        }
    }

    /// Stops and joins the watchdog (bounded), then dispatches the
    /// accumulated episodes.
    ///
    /// # Errors
    ///
    /// Returns [`EventLoopBlockError`] only under
    /// [`Action::Raise`](crate::config::Action::Raise) with at least one
    /// episode.
    pub fn close(self) -> Result<(), EventLoopBlockError> {
        self.close_internal(false)
    }

    pub(crate) fn close_internal(mut self, body_panicked: bool) -> Result<(), EventLoopBlockError> {
        let inner = self.inner.take().expect("blocking scope closed twice");
        let episodes = inner.watchdog.stop();
        match dispatch::dispatch_block(episodes, &inner.config) {
            Ok(()) => Ok(()),
            Err(error) if body_panicked => {
                dispatch::report_fault(inner.config.report_sink.as_ref(), &error.to_string());
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

impl Drop for BlockingScope {
    fn drop(&mut self) {
        // The watchdog thread must be released even on an unclosed drop;
        // only the Raise dispatch is lost, and that loss is reported.
        if let Some(inner) = self.inner.take() {
            let episodes = inner.watchdog.stop();
            if !episodes.is_empty() && inner.config.action == Action::Raise {
                dispatch::report_fault(
                    inner.config.report_sink.as_ref(),
                    &format!(
                        "blocking scope dropped without close; {} episode(s) reported here instead",
                        episodes.len()
                    ),
                );
            }
            tracing::warn!(
                target: crate::TARGET,
                "blocking scope dropped without close"
            );
        }
    }
}

/// Runs `body` inside a blocking-detection scope, preserving its return
/// value.
///
/// The watchdog is torn down exactly once, including when the body panics
/// (the panic then resumes after teardown and takes priority over any
/// episode error, which is reported through the log path instead).
///
/// # Errors
///
/// Returns [`EventLoopBlockError`] only under
/// [`Action::Raise`](crate::config::Action::Raise) with at least one
/// episode.
///
/// # Panics
///
/// Panics when called outside a runtime, and re-raises body panics.
pub async fn detect_blocking<F, Fut, T>(
    config: BlockingConfig,
    body: F,
) -> Result<T, EventLoopBlockError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let scope = BlockingScope::enter(config);
    match CatchUnwind::new(body()).await {
        Ok(value) => scope.close_internal(false).map(|()| value),
        Err(payload) => {
            let _ = scope.close_internal(true);
            std::panic::resume_unwind(payload);
        }
    }
}
