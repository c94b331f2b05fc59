//! Leakscope: scoped detection of leaked tasks, leaked threads, and
//! event-loop stalls.
//!
//! # Overview
//!
//! Leakscope answers, at a scope boundary, three questions test authors
//! keep re-implementing by hand: did this code path leave tasks running?
//! did it leave background threads running? and did it ever hog the event
//! loop without yielding? Detection is diff-based and observational — the
//! detectors never own the resources they report on, and (except for the
//! opt-in `Cancel` action) never alter them.
//!
//! # Detection model
//!
//! - **Task and thread leaks**: a snapshot of live resource identities is
//!   taken when a scope is entered and diffed against the live set at
//!   close. Anything alive now that was not alive before — minus the
//!   scope's own carrier and anything failing the configured name filter —
//!   is a finding.
//! - **Event-loop blocking**: a dedicated watchdog thread round-trips a
//!   trivial callback through the loop's injection queue on a fixed
//!   cadence. A round-trip exceeding the threshold is a blocking episode,
//!   recorded with the loop thread's stack sampled mid-block.
//! - **Actions**: findings are uniformly dispatched as warn, log, cancel
//!   (tasks only; degrades with notice elsewhere), or raise — the raised
//!   errors carry the full structured findings payload.
//!
//! Rust has no ambient task or thread enumeration, so the detectors
//! observe resources created through this crate: tasks spawned on its
//! [`runtime`], threads spawned through its instrumented [`thread`]
//! builder.
//!
//! # Example
//!
//! ```
//! use leakscope::{Action, Runtime, TaskLeakConfig};
//!
//! let rt = Runtime::new();
//! rt.block_on(async {
//!     let outcome = leakscope::detect_task_leaks(
//!         TaskLeakConfig::new().action(Action::Raise),
//!         || async {
//!             // spawn and await work here
//!         },
//!     )
//!     .await;
//!     assert!(outcome.is_ok());
//! });
//! ```
//!
//! # Module Structure
//!
//! - [`config`]: detector configuration, actions, name filters
//! - [`error`]: findings-as-data error surface
//! - [`report`]: leak reports and blocking episodes
//! - [`runtime`]: the current-thread cooperative executor
//! - [`scope`]: the detector scopes and wrapping forms
//! - [`thread`]: instrumented thread spawning
//! - [`test_utils`]: logging helpers for tests

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod error;
pub mod report;
pub mod runtime;
pub mod scope;
pub mod test_utils;
pub mod thread;

mod dispatch;
mod sampler;
mod snapshot;
mod watchdog;

/// Tracing target for everything this crate emits.
pub(crate) const TARGET: &str = "leakscope";

pub use config::{
    Action, BlockingConfig, CombinedConfig, ConfigError, NameFilter, ReportSink, TaskLeakConfig,
    ThreadLeakConfig,
};
pub use error::{
    CombinedLeakError, EventLoopBlockError, LeakError, TaskLeakError, ThreadLeakError,
};
pub use report::{BlockEpisode, LeakedTask, LeakedThread, TaskLeakReport, ThreadLeakReport};
pub use runtime::{yield_now, Handle, JoinError, Runtime, TaskHandle, TaskId};
pub use scope::{
    detect_blocking, detect_leaks, detect_task_leaks, detect_thread_leaks, BlockingScope,
    CombinedScope, TaskLeakScope, ThreadLeakScope,
};
pub use thread::ThreadToken;
