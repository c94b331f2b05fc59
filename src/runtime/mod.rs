//! Current-thread cooperative executor.
//!
//! This is the event loop the detectors observe. It is deliberately small:
//! one thread drives a main future plus any number of spawned tasks, with a
//! task table that snapshots enumerate, cooperative cancellation, and a
//! thread-safe injection queue that lets other threads (the watchdog in
//! particular) schedule callbacks onto the loop without requiring the loop
//! to already be idle.
//!
//! # Model
//!
//! - [`Runtime::block_on`] runs the loop on the calling thread. Each round
//!   it drains injected callbacks, polls whatever was woken, and parks when
//!   idle.
//! - [`Handle::spawn`] / [`Handle::spawn_named`] create tasks. Futures need
//!   not be `Send`: they are stored thread-locally on the loop thread, and
//!   spawning from any other thread is a usage error.
//! - [`TaskHandle`] observes a task; it never owns it. Dropping the handle
//!   leaves the task running — that is exactly the leak the task scope
//!   exists to catch.
//! - Cancellation is a request: [`TaskHandle::cancel`] marks the task and
//!   wakes it; the loop drops the future at the next scheduling point and
//!   settles joiners with [`JoinError::Cancelled`].
//!
//! Task panics are caught at the poll site, logged, and settle the task as
//! [`JoinError::Panicked`]; they never unwind the loop.

pub(crate) mod waker;

use crate::sampler::ThreadProbe;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use self::waker::WakerState;

/// Identity of a spawned task, stable for the task's lifetime.
///
/// Allocated from a per-runtime monotonic counter, so ascending `TaskId`
/// order is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// The main future driven by `block_on`; never present in the table.
    const MAIN: Self = Self(0);

    /// Returns the underlying numeric identifier.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Error returned when awaiting a [`TaskHandle`] whose task did not
/// complete normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The task was cancelled before completion.
    Cancelled,
    /// The task panicked; carries the rendered panic message.
    Panicked(String),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("task was cancelled"),
            Self::Panicked(message) => write!(f, "task panicked: {message}"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Live-task record handed to snapshots.
#[derive(Debug, Clone)]
pub(crate) struct LiveTask {
    pub(crate) id: TaskId,
    pub(crate) name: Option<String>,
    pub(crate) creation_stack: Option<Arc<Backtrace>>,
}

#[derive(Debug)]
struct TaskEntry {
    name: Option<String>,
    cancel_requested: bool,
    creation_stack: Option<Arc<Backtrace>>,
}

struct StoredTask {
    future: Pin<Box<dyn Future<Output = ()>>>,
    /// Settles joiners when the future is dropped without completing
    /// (cancellation or panic).
    abnormal: Box<dyn FnOnce(JoinError)>,
}

struct Shared {
    injected: SegQueue<Box<dyn FnOnce() + Send>>,
    tasks: Mutex<BTreeMap<TaskId, TaskEntry>>,
    wakers: Arc<WakerState>,
    next_task_id: AtomicU64,
    creation_tracking: AtomicUsize,
    probe: Mutex<Option<ThreadProbe>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
    static STORED: RefCell<HashMap<TaskId, StoredTask>> = RefCell::new(HashMap::new());
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

struct JoinSlot<T> {
    result: Option<Result<T, JoinError>>,
    waker: Option<Waker>,
}

struct JoinState<T> {
    slot: Mutex<JoinSlot<T>>,
    finished: AtomicBool,
}

impl<T> JoinState<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(JoinSlot {
                result: None,
                waker: None,
            }),
            finished: AtomicBool::new(false),
        }
    }

    fn complete(&self, result: Result<T, JoinError>) {
        let mut slot = self.slot.lock();
        if slot.result.is_none() && !self.finished.load(Ordering::Acquire) {
            slot.result = Some(result);
        }
        self.finished.store(true, Ordering::Release);
        let waker = slot.waker.take();
        drop(slot);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Observer handle for a spawned task.
///
/// The handle does not own the task: dropping it leaves the task running.
/// Await the handle to join the task's result.
pub struct TaskHandle<T> {
    id: TaskId,
    name: Option<String>,
    shared: Arc<Shared>,
    state: Arc<JoinState<T>>,
}

impl<T> TaskHandle<T> {
    /// Returns the task's identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the task's display name, if one was given at spawn.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns true once the task has settled (completed, cancelled, or
    /// panicked).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// Requests cancellation: marks the task and wakes it. The loop drops
    /// the future at the next scheduling point; this call does not wait.
    pub fn cancel(&self) {
        request_cancel(&self.shared, self.id);
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.state.slot.lock();
        if let Some(result) = slot.result.take() {
            return Poll::Ready(result);
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn request_cancel(shared: &Arc<Shared>, id: TaskId) {
    {
        let mut tasks = shared.tasks.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return; // already settled
        };
        entry.cancel_requested = true;
    }
    shared.wakers.wake(id);
}

/// Cloneable, `Send + Sync` reference to a [`Runtime`].
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The handle of the runtime driving the current thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside [`Runtime::block_on`].
    #[must_use]
    pub fn current() -> Self {
        Self::try_current().expect("no leakscope runtime is driving this thread")
    }

    /// Like [`Handle::current`], but returns `None` outside a runtime.
    #[must_use]
    pub fn try_current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Spawns an unnamed task onto the loop.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one driving this
    /// runtime's loop.
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.spawn_inner(None, future)
    }

    /// Spawns a task with a display name (visible in leak findings).
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one driving this
    /// runtime's loop.
    pub fn spawn_named<F>(&self, name: impl Into<String>, future: F) -> TaskHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.spawn_inner(Some(name.into()), future)
    }

    fn spawn_inner<F>(&self, name: Option<String>, future: F) -> TaskHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        assert!(
            self.is_loop_thread(),
            "spawn must be called from the runtime's loop thread"
        );
        let id = TaskId(self.shared.next_task_id.fetch_add(1, Ordering::Relaxed));
        let creation_stack = if self.shared.creation_tracking.load(Ordering::Relaxed) > 0 {
            Some(Arc::new(Backtrace::force_capture()))
        } else {
            None
        };

        let state = Arc::new(JoinState::new());
        let completion = Arc::clone(&state);
        let wrapped = async move {
            let value = future.await;
            completion.complete(Ok(value));
        };
        let abnormal = Arc::clone(&state);
        let stored = StoredTask {
            future: Box::pin(wrapped),
            abnormal: Box::new(move |err| abnormal.complete(Err(err))),
        };

        self.shared.tasks.lock().insert(
            id,
            TaskEntry {
                name: name.clone(),
                cancel_requested: false,
                creation_stack,
            },
        );
        STORED.with(|stored_tasks| stored_tasks.borrow_mut().insert(id, stored));
        self.shared.wakers.wake(id);

        TaskHandle {
            id,
            name,
            shared: Arc::clone(&self.shared),
            state,
        }
    }

    /// Enqueues a callback to run on the loop thread.
    ///
    /// Safe to call from any thread; this is the only cross-thread hand-off
    /// into the loop. The callback runs at the start of the next scheduling
    /// round — which is the whole point: while the loop is stuck inside a
    /// non-yielding poll, injected callbacks do not run.
    pub(crate) fn inject(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.injected.push(Box::new(callback));
        self.shared.wakers.parker().unpark();
    }

    /// OS-level identity of the thread currently driving the loop.
    pub(crate) fn probe(&self) -> Option<ThreadProbe> {
        *self.shared.probe.lock()
    }

    /// All not-yet-settled tasks, in creation order.
    pub(crate) fn alive_tasks(&self) -> Vec<LiveTask> {
        self.shared
            .tasks
            .lock()
            .iter()
            .map(|(id, entry)| LiveTask {
                id: *id,
                name: entry.name.clone(),
                creation_stack: entry.creation_stack.clone(),
            })
            .collect()
    }

    pub(crate) fn is_task_alive(&self, id: TaskId) -> bool {
        self.shared.tasks.lock().contains_key(&id)
    }

    pub(crate) fn request_cancel(&self, id: TaskId) {
        request_cancel(&self.shared, id);
    }

    /// The task the loop is currently polling, if any.
    pub(crate) fn current_task(&self) -> Option<TaskId> {
        CURRENT_TASK.with(Cell::get)
    }

    pub(crate) fn creation_tracking_enter(&self) {
        self.shared.creation_tracking.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn creation_tracking_exit(&self) {
        self.shared.creation_tracking.fetch_sub(1, Ordering::Relaxed);
    }

    fn is_loop_thread(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|handle| Arc::ptr_eq(&handle.shared, &self.shared))
        })
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("live_tasks", &self.shared.tasks.lock().len())
            .finish()
    }
}

/// The current-thread executor.
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Creates a fresh runtime. Nothing runs until [`Runtime::block_on`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                injected: SegQueue::new(),
                tasks: Mutex::new(BTreeMap::new()),
                wakers: Arc::new(WakerState::new()),
                next_task_id: AtomicU64::new(1),
                creation_tracking: AtomicUsize::new(0),
                probe: Mutex::new(None),
            }),
        }
    }

    /// Returns a cloneable handle to this runtime.
    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drives `future` (and everything spawned from it) to completion on
    /// the calling thread.
    ///
    /// Tasks still alive when the main future completes are dropped and
    /// settled as cancelled.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread is already inside a `block_on`.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        CURRENT.with(|current| {
            assert!(
                current.borrow().is_none(),
                "nested block_on on the same thread is not supported"
            );
            *current.borrow_mut() = Some(self.handle());
        });
        *self.shared.probe.lock() = Some(ThreadProbe::current());
        let _guard = EnterGuard {
            shared: Arc::clone(&self.shared),
        };

        let wakers = Arc::clone(&self.shared.wakers);
        let main_waker = wakers.waker_for(TaskId::MAIN);
        let mut future = Box::pin(future);
        let mut poll_main = true;

        loop {
            while let Some(callback) = self.shared.injected.pop() {
                callback();
            }

            let mut ready = Vec::new();
            for id in wakers.drain_woken() {
                if id == TaskId::MAIN {
                    poll_main = true;
                } else {
                    ready.push(id);
                }
            }

            if poll_main {
                poll_main = false;
                let mut cx = Context::from_waker(&main_waker);
                if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
                    return value;
                }
            }

            for id in ready {
                run_task(&self.shared, id);
            }

            if self.shared.injected.is_empty() && !wakers.has_woken() {
                wakers.parker().park();
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("live_tasks", &self.shared.tasks.lock().len())
            .finish()
    }
}

fn run_task(shared: &Arc<Shared>, id: TaskId) {
    let cancel_requested = match shared.tasks.lock().get(&id) {
        Some(entry) => entry.cancel_requested,
        None => return, // already settled
    };
    let Some(mut stored) = STORED.with(|tasks| tasks.borrow_mut().remove(&id)) else {
        return;
    };

    if cancel_requested {
        shared.tasks.lock().remove(&id);
        drop(stored.future);
        (stored.abnormal)(JoinError::Cancelled);
        return;
    }

    let waker = shared.wakers.waker_for(id);
    let mut cx = Context::from_waker(&waker);
    CURRENT_TASK.with(|current| current.set(Some(id)));
    let poll = panic::catch_unwind(AssertUnwindSafe(|| stored.future.as_mut().poll(&mut cx)));
    CURRENT_TASK.with(|current| current.set(None));

    match poll {
        Ok(Poll::Ready(())) => {
            shared.tasks.lock().remove(&id);
        }
        Ok(Poll::Pending) => {
            STORED.with(|tasks| tasks.borrow_mut().insert(id, stored));
        }
        Err(payload) => {
            shared.tasks.lock().remove(&id);
            let message = panic_message(payload.as_ref());
            tracing::error!(target: crate::TARGET, task = %id, %message, "task panicked");
            drop(stored.future);
            (stored.abnormal)(JoinError::Panicked(message));
        }
    }
}

/// Renders a panic payload into a displayable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct EnterGuard {
    shared: Arc<Shared>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
        CURRENT_TASK.with(|current| current.set(None));
        *self.shared.probe.lock() = None;
        self.shared.tasks.lock().clear();
        let leftovers = STORED.with(|tasks| std::mem::take(&mut *tasks.borrow_mut()));
        for (_, stored) in leftovers {
            drop(stored.future);
            (stored.abnormal)(JoinError::Cancelled);
        }
    }
}

/// Yields to the scheduler once, letting other ready tasks (and injected
/// callbacks) run before this future resumes.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::time::{Duration, Instant};

    #[test]
    fn block_on_returns_value() {
        init_test_logging();
        let rt = Runtime::new();
        let value = rt.block_on(async { 41 + 1 });
        assert_eq!(value, 42);
    }

    #[test]
    fn spawn_and_join() {
        init_test_logging();
        let rt = Runtime::new();
        let value = rt.block_on(async {
            let handle = Handle::current().spawn_named("adder", async { 2 + 2 });
            handle.await
        });
        assert_eq!(value, Ok(4));
    }

    #[test]
    fn spawned_task_visible_until_settled() {
        init_test_logging();
        let rt = Runtime::new();
        rt.block_on(async {
            let runtime = Handle::current();
            let handle = runtime.spawn_named("pending", std::future::pending::<()>());
            assert!(runtime.is_task_alive(handle.id()));
            assert_eq!(
                runtime.alive_tasks()[0].name.as_deref(),
                Some("pending")
            );

            handle.cancel();
            yield_now().await;
            assert!(!runtime.is_task_alive(handle.id()));
        });
    }

    #[test]
    fn cancel_settles_join_with_cancelled() {
        init_test_logging();
        let rt = Runtime::new();
        let result = rt.block_on(async {
            let handle = Handle::current().spawn(std::future::pending::<u8>());
            handle.cancel();
            handle.await
        });
        assert_eq!(result, Err(JoinError::Cancelled));
    }

    #[test]
    fn task_panic_is_contained() {
        init_test_logging();
        let rt = Runtime::new();
        let result = rt.block_on(async {
            let handle = Handle::current().spawn(async {
                panic!("boom");
            });
            handle.await
        });
        match result {
            Err(JoinError::Panicked(message)) => assert!(message.contains("boom")),
            other => panic!("expected Panicked, got {other:?}"),
        }
    }

    #[test]
    fn injected_callback_runs_between_polls() {
        init_test_logging();
        let rt = Runtime::new();
        let ran = Arc::new(AtomicBool::new(false));
        let observed = rt.block_on(async {
            let handle = Handle::current();
            let flag = Arc::clone(&ran);
            let injector = std::thread::spawn(move || {
                handle.inject(move || flag.store(true, Ordering::Release));
            });
            injector.join().expect("injector thread panicked");

            // The callback runs at the next scheduling round.
            let deadline = Instant::now() + Duration::from_secs(1);
            while !ran.load(Ordering::Acquire) && Instant::now() < deadline {
                yield_now().await;
            }
            ran.load(Ordering::Acquire)
        });
        assert!(observed, "injected callback never ran");
    }

    #[test]
    #[should_panic(expected = "nested block_on")]
    fn nested_block_on_rejected() {
        let rt = Runtime::new();
        rt.block_on(async {
            let inner = Runtime::new();
            inner.block_on(async {});
        });
    }

    #[test]
    fn leftover_tasks_settle_cancelled_when_loop_ends() {
        init_test_logging();
        let rt = Runtime::new();
        let handle = rt.block_on(async {
            Handle::current().spawn_named("orphan", std::future::pending::<()>())
        });
        // The loop has ended; the orphan was dropped and settled.
        assert!(handle.is_finished());
    }

    #[test]
    fn task_ids_are_creation_ordered() {
        init_test_logging();
        let rt = Runtime::new();
        rt.block_on(async {
            let runtime = Handle::current();
            let first = runtime.spawn_named("first", std::future::pending::<()>());
            let second = runtime.spawn_named("second", std::future::pending::<()>());
            assert!(first.id() < second.id());

            let names: Vec<_> = runtime
                .alive_tasks()
                .into_iter()
                .map(|task| task.name)
                .collect();
            assert_eq!(
                names,
                vec![Some("first".to_string()), Some("second".to_string())]
            );
            first.cancel();
            second.cancel();
        });
    }
}
