//! Finding payloads: leak reports and blocking episodes.
//!
//! These are the data the detectors hand to the action dispatcher and that
//! the `Raise` errors carry. All of them are immutable once produced and
//! deterministically ordered (creation order), so assertions against them
//! are reproducible.

use crate::runtime::TaskId;
use crate::thread::ThreadToken;
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A task that was alive at scope exit but not at scope enter.
#[derive(Debug, Clone)]
pub struct LeakedTask {
    /// The task's identity.
    pub id: TaskId,
    /// The display name given at spawn, if any.
    pub name: Option<String>,
    /// Spawn-site backtrace, present when the scope enabled creation
    /// tracking.
    pub creation_stack: Option<Arc<Backtrace>>,
}

impl LeakedTask {
    /// The name used in reports: the display name, or `task-<id>`.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

impl fmt::Display for LeakedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// A thread that was alive at scope exit but not at scope enter.
#[derive(Debug, Clone)]
pub struct LeakedThread {
    /// The thread's registry identity.
    pub token: ThreadToken,
    /// The display name given at spawn, if any.
    pub name: Option<String>,
    /// Whether the thread carries the daemon marker.
    pub daemon: bool,
}

impl LeakedThread {
    /// The name used in reports: the display name, or `thread-<token>`.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.token.to_string())
    }
}

impl fmt::Display for LeakedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())?;
        if self.daemon {
            f.write_str(" (daemon)")?;
        }
        Ok(())
    }
}

/// Ordered task-leak findings for one scope.
#[derive(Debug, Clone, Default)]
pub struct TaskLeakReport {
    /// Findings in creation order.
    pub leaked: Vec<LeakedTask>,
}

impl TaskLeakReport {
    /// True when there is nothing to report.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaked.is_empty()
    }

    /// Number of findings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.leaked.len()
    }

    /// Display names of all findings, in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.leaked.iter().map(LeakedTask::display_name).collect()
    }
}

impl fmt::Display for TaskLeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} leaked task(s): ", self.leaked.len())?;
        for (index, task) in self.leaked.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{task}")?;
        }
        Ok(())
    }
}

/// Ordered thread-leak findings for one scope.
#[derive(Debug, Clone, Default)]
pub struct ThreadLeakReport {
    /// Findings in registration order.
    pub leaked: Vec<LeakedThread>,
}

impl ThreadLeakReport {
    /// True when there is nothing to report.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaked.is_empty()
    }

    /// Number of findings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.leaked.len()
    }

    /// Display names of all findings, in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.leaked
            .iter()
            .map(LeakedThread::display_name)
            .collect()
    }
}

impl fmt::Display for ThreadLeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} leaked thread(s): ", self.leaked.len())?;
        for (index, thread) in self.leaked.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{thread}")?;
        }
        Ok(())
    }
}

/// One continuous interval during which the event loop failed to service
/// the watchdog's probe within the configured threshold.
#[derive(Debug, Clone)]
pub struct BlockEpisode {
    /// When the probe cycle that detected the episode started.
    pub started_at: Instant,
    /// Observed duration: from probe start until the probe callback finally
    /// ran, or until the wait bound expired.
    pub duration: Duration,
    /// Rendered stack of the loop thread, captured mid-block. `None` when
    /// capture degraded.
    pub stack: Option<String>,
    /// True when the probe callback never ran within the wait bound; the
    /// duration is then a lower bound on the real blocking interval.
    pub ping_lost: bool,
}

impl fmt::Display for BlockEpisode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event loop blocked for {:.1?}{}{}",
            self.duration,
            if self.ping_lost { " (at least)" } else { "" },
            if self.stack.is_some() {
                ""
            } else {
                " (no stack captured)"
            },
        )
    }
}
