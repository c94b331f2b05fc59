//! Resource snapshots and the baseline/exit diff.
//!
//! A snapshot is an identity set of live tracked resources taken at one
//! instant. The leak scopes take one at enter (the baseline) and diff
//! against the live set at exit: a finding is a resource that is alive now,
//! was not alive at the baseline, is not the scope's own carrier, and
//! matches the configured name filter. Findings come out in creation order
//! (identities are monotonic), so reports are reproducible.

use crate::config::NameFilter;
use crate::report::{LeakedTask, LeakedThread};
use crate::runtime::{Handle, TaskId};
use crate::thread::{self, ThreadToken};
use std::collections::HashSet;
use std::time::Instant;

/// Identity set of the tasks alive on the runtime at one instant.
#[derive(Debug)]
pub(crate) struct TaskSnapshot {
    ids: HashSet<TaskId>,
    taken_at: Instant,
}

impl TaskSnapshot {
    /// Captures the live task set, excluding the capturing task itself.
    pub(crate) fn capture(handle: &Handle) -> Self {
        let own = handle.current_task();
        let ids = handle
            .alive_tasks()
            .into_iter()
            .map(|task| task.id)
            .filter(|id| Some(*id) != own)
            .collect();
        Self {
            ids,
            taken_at: Instant::now(),
        }
    }

    /// Tasks alive now that were not alive at this baseline, filtered and
    /// in creation order.
    pub(crate) fn new_alive_since(
        &self,
        handle: &Handle,
        filter: Option<&NameFilter>,
    ) -> Vec<LeakedTask> {
        let own = handle.current_task();
        handle
            .alive_tasks()
            .into_iter()
            .filter(|task| Some(task.id) != own)
            .filter(|task| !self.ids.contains(&task.id))
            .filter(|task| {
                filter.map_or(true, |f| f.matches(task.name.as_deref()))
            })
            .map(|task| LeakedTask {
                id: task.id,
                name: task.name,
                creation_stack: task.creation_stack,
            })
            .collect()
    }

    pub(crate) fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Identity set of the instrumented threads alive at one instant.
#[derive(Debug)]
pub(crate) struct ThreadSnapshot {
    tokens: HashSet<ThreadToken>,
    taken_at: Instant,
}

impl ThreadSnapshot {
    /// Captures the live registered-thread set, daemons included (daemon
    /// filtering is an exit-time decision).
    pub(crate) fn capture() -> Self {
        let tokens = thread::live_threads()
            .into_iter()
            .map(|record| record.token)
            .collect();
        Self {
            tokens,
            taken_at: Instant::now(),
        }
    }

    /// Threads alive now that were not alive at this baseline, filtered
    /// and in registration order.
    pub(crate) fn new_alive_since(
        &self,
        exclude_daemon: bool,
        filter: Option<&NameFilter>,
    ) -> Vec<LeakedThread> {
        thread::live_threads()
            .into_iter()
            .filter(|record| !self.tokens.contains(&record.token))
            .filter(|record| !(exclude_daemon && record.daemon))
            .filter(|record| {
                filter.map_or(true, |f| f.matches(record.name.as_deref()))
            })
            .map(|record| LeakedThread {
                token: record.token,
                name: record.name,
                daemon: record.daemon,
            })
            .collect()
    }

    pub(crate) fn taken_at(&self) -> Instant {
        self.taken_at
    }
}
