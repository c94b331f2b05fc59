//! Instrumented thread spawning.
//!
//! Rust has no process-wide thread enumeration, so thread-leak detection
//! only sees threads that were spawned through this module: each spawn
//! registers a record (token, display name, daemon marker, alive flag) in a
//! process-wide registry, and a drop guard inside the spawned closure clears
//! the alive flag on any exit, panic included.
//!
//! The daemon marker is a registry tag, not an OS property: it declares the
//! thread background/expendable, which makes thread-leak detection ignore it
//! by default. The detectors' own bookkeeping threads (the watchdog) are
//! spawned directly through `std::thread` and therefore never register.

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic counter for thread tokens; ascending token order is
/// registration order.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

static REGISTRY: Mutex<Vec<ThreadRecord>> = Mutex::new(Vec::new());

/// Identity of an instrumented thread, stable for the thread's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadToken(u64);

impl ThreadToken {
    /// Returns the underlying numeric identifier.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw_for_test(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct ThreadRecord {
    token: ThreadToken,
    name: Option<String>,
    daemon: bool,
    alive: Arc<AtomicBool>,
}

/// Live-thread record handed to snapshots.
#[derive(Debug, Clone)]
pub(crate) struct LiveThread {
    pub(crate) token: ThreadToken,
    pub(crate) name: Option<String>,
    pub(crate) daemon: bool,
}

/// Configures and spawns an instrumented thread.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    daemon: bool,
}

impl Builder {
    /// A builder with no name and the daemon marker off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Display name, also passed through to `std::thread::Builder`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks the thread background/expendable; thread-leak detection
    /// ignores daemon threads unless configured otherwise.
    #[must_use]
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Spawns the thread, registering it with the leak-detection registry.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `std::thread` spawn failure; nothing is
    /// registered in that case.
    pub fn spawn<F, T>(self, f: F) -> io::Result<std::thread::JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let token = ThreadToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        let alive = Arc::new(AtomicBool::new(true));
        let guard_flag = Arc::clone(&alive);

        let mut builder = std::thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        let handle = builder.spawn(move || {
            let _guard = AliveGuard(guard_flag);
            f()
        })?;

        let mut registry = REGISTRY.lock();
        registry.retain(|record| record.alive.load(Ordering::Acquire));
        registry.push(ThreadRecord {
            token,
            name: self.name,
            daemon: self.daemon,
            alive,
        });
        Ok(handle)
    }
}

struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Spawns an unnamed, non-daemon instrumented thread.
///
/// # Panics
///
/// Panics if the OS refuses to spawn the thread, matching
/// `std::thread::spawn`.
pub fn spawn<F, T>(f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f).expect("failed to spawn thread")
}

/// Spawns a named, non-daemon instrumented thread.
///
/// # Panics
///
/// Panics if the OS refuses to spawn the thread, matching
/// `std::thread::spawn`.
pub fn spawn_named<F, T>(name: impl Into<String>, f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new()
        .name(name)
        .spawn(f)
        .expect("failed to spawn thread")
}

/// All registered threads still alive, in registration order.
pub(crate) fn live_threads() -> Vec<LiveThread> {
    let registry = REGISTRY.lock();
    let mut live: Vec<LiveThread> = registry
        .iter()
        .filter(|record| record.alive.load(Ordering::Acquire))
        .map(|record| LiveThread {
            token: record.token,
            name: record.name.clone(),
            daemon: record.daemon,
        })
        .collect();
    live.sort_by_key(|thread| thread.token);
    live
}
