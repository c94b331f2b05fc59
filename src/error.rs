//! Detection errors.
//!
//! These are contract surfaces, not just messages: every error carries the
//! full structured findings payload so tooling built on top (test-framework
//! integrations in particular) can assert on names, counts, and durations
//! rather than parsing strings. They are returned only under
//! [`Action::Raise`](crate::config::Action::Raise); configuration problems
//! are [`ConfigError`](crate::config::ConfigError) instead.

use crate::report::{BlockEpisode, TaskLeakReport, ThreadLeakReport};

/// Tasks were still alive at scope exit.
#[derive(Debug, thiserror::Error)]
#[error("task leak detected: {report}")]
pub struct TaskLeakError {
    /// The ordered findings.
    pub report: TaskLeakReport,
}

/// Instrumented threads were still alive at scope exit.
#[derive(Debug, thiserror::Error)]
#[error("thread leak detected: {report}")]
pub struct ThreadLeakError {
    /// The ordered findings.
    pub report: ThreadLeakReport,
}

/// The event loop failed to yield within the configured threshold.
#[derive(Debug, thiserror::Error)]
#[error("event loop blocked: {}", summarize_episodes(.episodes))]
pub struct EventLoopBlockError {
    /// Episodes in detection order.
    pub episodes: Vec<BlockEpisode>,
}

fn summarize_episodes(episodes: &[BlockEpisode]) -> String {
    let rendered: Vec<String> = episodes
        .iter()
        .map(|episode| format!("{:.1?}", episode.duration))
        .collect();
    format!(
        "{} episode(s) [{}]",
        episodes.len(),
        rendered.join(", ")
    )
}

/// Any one detector's finding error.
#[derive(Debug, thiserror::Error)]
pub enum LeakError {
    /// Task-leak findings.
    #[error(transparent)]
    Task(#[from] TaskLeakError),
    /// Thread-leak findings.
    #[error(transparent)]
    Thread(#[from] ThreadLeakError),
    /// Event-loop blocking findings.
    #[error(transparent)]
    Blocking(#[from] EventLoopBlockError),
}

/// Aggregate error from a combined scope.
///
/// Every enabled detector finalizes even when an earlier one raised; their
/// errors collect here in exit order (threads, blocking, tasks).
#[derive(Debug, thiserror::Error)]
#[error("{}", render_errors(.errors))]
pub struct CombinedLeakError {
    /// Per-detector errors, in exit order.
    pub errors: Vec<LeakError>,
}

fn render_errors(errors: &[LeakError]) -> String {
    let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!(
        "leak detection reported {} issue(s): {}",
        errors.len(),
        rendered.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::LeakedTask;
    use crate::runtime::TaskId;
    use std::time::{Duration, Instant};

    #[test]
    fn task_error_display_carries_names() {
        let err = TaskLeakError {
            report: TaskLeakReport {
                leaked: vec![LeakedTask {
                    id: TaskId::from_raw(1),
                    name: Some("leaked".to_string()),
                    creation_stack: None,
                }],
            },
        };
        let rendered = err.to_string();
        assert!(rendered.contains("task leak detected"));
        assert!(rendered.contains("leaked"));
    }

    #[test]
    fn block_error_display_counts_episodes() {
        let err = EventLoopBlockError {
            episodes: vec![BlockEpisode {
                started_at: Instant::now(),
                duration: Duration::from_millis(150),
                stack: None,
                ping_lost: false,
            }],
        };
        assert!(err.to_string().contains("1 episode(s)"));
    }

    #[test]
    fn combined_error_joins_kinds() {
        let err = CombinedLeakError {
            errors: vec![
                LeakError::from(TaskLeakError {
                    report: TaskLeakReport::default(),
                }),
                LeakError::from(EventLoopBlockError { episodes: vec![] }),
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("2 issue(s)"));
        assert!(rendered.contains("task leak detected"));
        assert!(rendered.contains("event loop blocked"));
    }
}
