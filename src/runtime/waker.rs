//! Waker plumbing for the current-thread executor.
//!
//! Wakes are recorded into a deduplicated ready list and unpark the loop if
//! it is idle. Safe Rust only; wakers may be invoked from any thread.

use super::TaskId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::task::{Wake, Waker};

/// Blocks the loop thread between scheduling rounds.
///
/// A notification arriving before `park` is not lost: the flag stays set
/// until consumed.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    pub(crate) fn park(&self) {
        let mut notified = self.notified.lock();
        while !*notified {
            self.condvar.wait(&mut notified);
        }
        *notified = false;
    }

    pub(crate) fn unpark(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.condvar.notify_one();
    }
}

/// Shared state for the waker system: the woken list plus the parker.
#[derive(Debug, Default)]
pub(crate) struct WakerState {
    woken: Mutex<Vec<TaskId>>,
    parker: Parker,
}

impl WakerState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a waker that marks `task` ready and unparks the loop.
    pub(crate) fn waker_for(self: &Arc<Self>, task: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            state: Arc::clone(self),
            task,
        }))
    }

    /// Drains all woken tasks in wake order.
    pub(crate) fn drain_woken(&self) -> Vec<TaskId> {
        let mut woken = self.woken.lock();
        std::mem::take(&mut *woken)
    }

    /// Returns true if any task is waiting to be scheduled.
    pub(crate) fn has_woken(&self) -> bool {
        !self.woken.lock().is_empty()
    }

    pub(crate) fn wake(&self, task: TaskId) {
        {
            let mut woken = self.woken.lock();
            if !woken.contains(&task) {
                woken.push(task);
            }
        }
        self.parker.unpark();
    }

    pub(crate) fn parker(&self) -> &Parker {
        &self.parker
    }
}

struct TaskWaker {
    state: Arc<WakerState>,
    task: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.state.wake(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.state.wake(self.task);
    }
}
