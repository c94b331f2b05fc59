//! Cross-thread stack capture.
//!
//! The watchdog needs the call stack of the loop thread *while that thread
//! is blocked*, which rules out asking it to capture its own backtrace. On
//! Unix this is done by signaling the target thread with `SIGPROF`: the
//! handler runs on the interrupted thread, captures a [`Backtrace`] into a
//! shared slot, and flags completion. On other platforms capture returns
//! `None`.
//!
//! Everything here is best-effort: an uninstallable handler, a signal that
//! cannot be delivered, or a capture that never lands within the wait bound
//! all degrade to `None` and are never fatal. The handler allocates while
//! capturing, which is not strictly async-signal-safe; for a diagnostics
//! tool interrupting a thread parked in a blocking call this is an accepted
//! trade, not a correctness foundation.

#![allow(unsafe_code)]

use std::time::Duration;

/// How long a single capture waits for the signaled thread to publish its
/// stack before degrading to `None`.
const CAPTURE_WAIT: Duration = Duration::from_millis(100);

/// OS-level identity of a thread, recorded on the thread itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadProbe {
    #[cfg(unix)]
    pthread: libc::pthread_t,
    #[cfg(not(unix))]
    _unsupported: (),
}

// SAFETY: a pthread identifier is a plain value; it is only ever passed to
// pthread_kill, never dereferenced.
#[cfg(unix)]
unsafe impl Send for ThreadProbe {}
#[cfg(unix)]
unsafe impl Sync for ThreadProbe {}

impl ThreadProbe {
    /// Probe for the calling thread.
    pub(crate) fn current() -> Self {
        #[cfg(unix)]
        {
            Self {
                // SAFETY: pthread_self has no preconditions.
                pthread: unsafe { libc::pthread_self() },
            }
        }
        #[cfg(not(unix))]
        {
            Self { _unsupported: () }
        }
    }
}

/// Captures the current stack of the probed thread, best-effort.
pub(crate) fn capture_stack(probe: Option<ThreadProbe>) -> Option<String> {
    let probe = probe?;
    #[cfg(unix)]
    {
        imp::capture(probe)
    }
    #[cfg(not(unix))]
    {
        let _ = probe;
        None
    }
}

#[cfg(unix)]
mod imp {
    use super::{ThreadProbe, CAPTURE_WAIT};
    use std::backtrace::Backtrace;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, Once};
    use std::time::Instant;

    static INSTALL: Once = Once::new();
    static INSTALL_OK: AtomicBool = AtomicBool::new(false);
    /// Serializes samplers so one pending signal owns the slot at a time.
    static SAMPLE_GUARD: Mutex<()> = Mutex::new(());
    static SLOT: Mutex<Option<Backtrace>> = Mutex::new(None);
    static DONE: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigprof(_signal: libc::c_int) {
        let backtrace = Backtrace::force_capture();
        if let Ok(mut slot) = SLOT.lock() {
            *slot = Some(backtrace);
        }
        DONE.store(true, Ordering::Release);
    }

    fn install_handler() -> bool {
        INSTALL.call_once(|| {
            // SAFETY: sigaction is initialized field-by-field below; the
            // handler only touches sampler-owned statics.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                libc::sigemptyset(&mut action.sa_mask);
                action.sa_sigaction = on_sigprof as extern "C" fn(libc::c_int) as usize;
                action.sa_flags = libc::SA_RESTART;
                if libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut()) == 0 {
                    INSTALL_OK.store(true, Ordering::Release);
                }
            }
        });
        INSTALL_OK.load(Ordering::Acquire)
    }

    pub(super) fn capture(probe: ThreadProbe) -> Option<String> {
        if !install_handler() {
            return None;
        }
        let _guard = SAMPLE_GUARD.lock().ok()?;
        DONE.store(false, Ordering::Release);
        if let Ok(mut slot) = SLOT.lock() {
            *slot = None;
        }

        // SAFETY: the probe was recorded by the loop thread at loop start,
        // and the loop thread outlives the scope that samples it.
        let rc = unsafe { libc::pthread_kill(probe.pthread, libc::SIGPROF) };
        if rc != 0 {
            return None;
        }

        let deadline = Instant::now() + CAPTURE_WAIT;
        while !DONE.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
        let backtrace = SLOT.lock().ok()?.take()?;
        Some(backtrace.to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn captures_a_sleeping_thread() {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let (probe_tx, probe_rx) = std::sync::mpsc::channel();
        let sleeper = std::thread::spawn(move || {
            probe_tx
                .send(ThreadProbe::current())
                .expect("probe receiver dropped");
            while !stop_flag.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let probe = probe_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("sleeper never reported its probe");
        let stack = capture_stack(Some(probe));
        stop.store(true, Ordering::Release);
        sleeper.join().expect("sleeper panicked");

        let stack = stack.expect("capture failed on unix");
        assert!(
            stack.contains("sleep"),
            "expected a sleeping frame in:\n{stack}"
        );
    }

    #[test]
    fn missing_probe_degrades_to_none() {
        assert!(capture_stack(None).is_none());
    }
}
