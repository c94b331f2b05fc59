//! Detector scopes.
//!
//! Every detector has two entry points over one scope type:
//!
//! - the scoped-acquisition form: `enter(config)` arms the detector and
//!   returns a scope object; `close(scope)` finalizes it — capture, diff,
//!   dispatch — exactly once;
//! - the wrapping form (`detect_*`): constructs the same scope around a
//!   single body invocation, preserves the body's return value, and
//!   re-raises a body panic after finalization (body failure always takes
//!   priority; findings that would have raised are reported through the
//!   log path instead).
//!
//! A scope dropped without `close` logs a diagnostic and skips detection
//! (finalization cannot run from `Drop`), but still releases anything it
//! owns — the blocking scope's watchdog thread in particular.

pub mod blocking;
pub mod combined;
pub mod task;
pub mod thread;

pub use blocking::{detect_blocking, BlockingScope};
pub use combined::{detect_leaks, CombinedScope};
pub use task::{detect_task_leaks, TaskLeakScope};
pub use thread::{detect_thread_leaks, ThreadLeakScope};

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Future adapter that converts a body panic into a value, so the wrapping
/// forms can finalize their scope before resuming the unwind.
pub(crate) struct CatchUnwind<F: Future> {
    inner: Pin<Box<F>>,
}

impl<F: Future> CatchUnwind<F> {
    pub(crate) fn new(future: F) -> Self {
        Self {
            inner: Box::pin(future),
        }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::panic::catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll(cx))) {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}
