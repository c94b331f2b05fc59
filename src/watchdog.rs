//! The event-loop watchdog thread.
//!
//! A blocked cooperative loop cannot observe itself, so responsiveness is
//! measured from outside: a dedicated thread repeatedly round-trips a
//! trivial callback through the loop's injection queue and times how long
//! the loop takes to run it. A round-trip that outlives the threshold is a
//! blocking episode; the watchdog samples the loop thread's stack while it
//! is still stuck, keeps waiting (bounded) for the callback to land so the
//! episode duration is real rather than guessed, records the episode, and
//! dispatches it.
//!
//! One watchdog thread per scope, created at enter and joined (bounded) at
//! exit — never pooled, so its lifetime is trivial to reason about.

use crate::config::BlockingConfig;
use crate::dispatch;
use crate::report::BlockEpisode;
use crate::runtime::Handle;
use crate::sampler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::{Duration, Instant};

/// How long scope close waits for the watchdog thread to terminate before
/// abandoning it and reporting an internal fault.
pub(crate) const WATCHDOG_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Granularity at which bounded waits re-check the shutdown flag.
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Upper bound on how long one probe cycle waits for its callback before
/// emitting a best-effort episode with a lower-bound duration.
fn ping_wait_bound(threshold: Duration) -> Duration {
    (threshold * 10).max(Duration::from_secs(1))
}

/// One-shot signal usable across threads, with bounded waits.
pub(crate) struct Latch {
    flag: AtomicBool,
    lock: StdMutex<()>,
    condvar: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            lock: StdMutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        self.flag.store(true, Ordering::Release);
        let _guard = self.lock.lock().expect("latch lock poisoned");
        self.condvar.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for the latch; returns whether it is set.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().expect("latch lock poisoned");
        while !self.is_set() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, _timed_out) = self
                .condvar
                .wait_timeout(guard, remaining)
                .expect("latch lock poisoned");
            guard = next;
        }
        true
    }
}

enum PingWait {
    /// The callback ran; the loop is (or became) responsive.
    Done,
    /// The wait window elapsed with the callback still queued.
    TimedOut,
    /// Shutdown was requested while waiting.
    Stopped,
}

fn wait_ping(ping: &Latch, shutdown: &Latch, timeout: Duration) -> PingWait {
    let deadline = Instant::now() + timeout;
    loop {
        if ping.is_set() {
            return PingWait::Done;
        }
        if shutdown.is_set() {
            return PingWait::Stopped;
        }
        let now = Instant::now();
        if now >= deadline {
            return PingWait::TimedOut;
        }
        ping.wait_timeout((deadline - now).min(WAIT_SLICE));
    }
}

/// Owner of one watchdog thread and its accumulated episodes.
pub(crate) struct Watchdog {
    shutdown: Arc<Latch>,
    episodes: Arc<Mutex<Vec<BlockEpisode>>>,
    thread: Option<std::thread::JoinHandle<()>>,
    config: BlockingConfig,
}

impl Watchdog {
    /// Spawns the watchdog thread. A spawn failure is an internal fault
    /// (reported through the log path), not a panic: the scope then simply
    /// observes nothing.
    pub(crate) fn start(runtime: Handle, config: BlockingConfig) -> Self {
        let shutdown = Arc::new(Latch::new());
        let episodes = Arc::new(Mutex::new(Vec::new()));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_episodes = Arc::clone(&episodes);
        let thread_config = config.clone();
        let thread = std::thread::Builder::new()
            .name("leakscope-watchdog".to_string())
            .spawn(move || watch(&runtime, &thread_config, &thread_shutdown, &thread_episodes));

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(error) => {
                dispatch::report_fault(
                    config.report_sink.as_ref(),
                    &format!("failed to spawn watchdog thread: {error}"),
                );
                None
            }
        };

        Self {
            shutdown,
            episodes,
            thread,
            config,
        }
    }

    /// Signals shutdown, joins the thread within [`WATCHDOG_JOIN_TIMEOUT`],
    /// and returns the accumulated episodes. Join-timeout expiry abandons
    /// the thread and reports an internal fault; it never hangs.
    pub(crate) fn stop(mut self) -> Vec<BlockEpisode> {
        self.shutdown.set();
        if let Some(thread) = self.thread.take() {
            let deadline = Instant::now() + WATCHDOG_JOIN_TIMEOUT;
            while !thread.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if thread.is_finished() {
                if thread.join().is_err() {
                    dispatch::report_fault(
                        self.config.report_sink.as_ref(),
                        "watchdog thread panicked",
                    );
                }
            } else {
                dispatch::report_fault(
                    self.config.report_sink.as_ref(),
                    "watchdog thread did not stop within the join timeout; abandoning it",
                );
            }
        }
        std::mem::take(&mut *self.episodes.lock())
    }
}

fn watch(
    runtime: &Handle,
    config: &BlockingConfig,
    shutdown: &Latch,
    episodes: &Mutex<Vec<BlockEpisode>>,
) {
    let wait_bound = ping_wait_bound(config.threshold());
    loop {
        if shutdown.is_set() {
            return;
        }

        let cycle_start = Instant::now();
        let ping = Arc::new(Latch::new());
        let callback_ping = Arc::clone(&ping);
        runtime.inject(move || callback_ping.set());

        match wait_ping(&ping, shutdown, config.threshold()) {
            PingWait::Stopped => return,
            PingWait::Done => {}
            PingWait::TimedOut => {
                // The loop is stuck right now: sample its stack mid-block,
                // then keep waiting (bounded) so the reported duration is
                // the real round-trip rather than just the threshold.
                let stack = sampler::capture_stack(runtime.probe());
                if stack.is_none() {
                    tracing::debug!(
                        target: crate::TARGET,
                        "loop-thread stack capture degraded to none"
                    );
                }
                let remaining = wait_bound.saturating_sub(cycle_start.elapsed());
                let outcome = wait_ping(&ping, shutdown, remaining);
                let episode = BlockEpisode {
                    started_at: cycle_start,
                    duration: cycle_start.elapsed(),
                    stack,
                    ping_lost: matches!(outcome, PingWait::TimedOut),
                };
                episodes.lock().push(episode.clone());
                dispatch::report_episode(&episode, config);
                if matches!(outcome, PingWait::Stopped) {
                    return;
                }
            }
        }

        if let Some(rest) = config.check_interval().checked_sub(cycle_start.elapsed()) {
            if shutdown.wait_timeout(rest) {
                return;
            }
        }
    }
}
