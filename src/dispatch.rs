//! Uniform action dispatch for detection findings.
//!
//! Every detector funnels its findings through here. Empty findings are a
//! no-op regardless of action. `Warn` and `Log` report and continue;
//! `Cancel` is only meaningful for tasks and degrades to `Warn` (with an
//! explicit degradation notice) for threads and blocking episodes; `Raise`
//! surfaces as the finding-kind-specific error out of scope close.
//!
//! Internal detection faults (grace-period expiry, watchdog join timeout)
//! go through [`report_fault`]: always the log path, whatever the
//! configured action, so they can never abort a teardown.

use crate::config::{Action, BlockingConfig, ReportSink, TaskLeakConfig, ThreadLeakConfig};
use crate::error::{EventLoopBlockError, TaskLeakError, ThreadLeakError};
use crate::report::{BlockEpisode, TaskLeakReport, ThreadLeakReport};
use crate::runtime::{yield_now, Handle};
use std::time::Instant;

/// Writes `message` through the sink, or as a crate-target warning when no
/// sink is configured.
pub(crate) fn emit_report(sink: Option<&ReportSink>, message: &str) {
    match sink {
        Some(sink) => (**sink)(message),
        None => tracing::warn!(target: crate::TARGET, "{message}"),
    }
}

/// Reports an internal detection fault. Always the log path: faults must
/// never replace findings or abort scope teardown.
pub(crate) fn report_fault(sink: Option<&ReportSink>, message: &str) {
    emit_report(sink, message);
}

/// Dispatches task-leak findings.
///
/// `Cancel` requests cancellation of every finding, then waits (yielding,
/// so the loop can actually process the cancellations) until all findings
/// settle or the grace period expires; unsettled stragglers go through the
/// log path as a fallback.
pub(crate) async fn dispatch_tasks(
    report: TaskLeakReport,
    config: &TaskLeakConfig,
    runtime: &Handle,
) -> Result<(), TaskLeakError> {
    if report.is_empty() {
        return Ok(());
    }
    match config.action {
        Action::Warn => {
            tracing::warn!(
                target: crate::TARGET,
                count = report.len(),
                "{report}"
            );
            Ok(())
        }
        Action::Log => {
            emit_report(config.report_sink.as_ref(), &report.to_string());
            Ok(())
        }
        Action::Raise => Err(TaskLeakError { report }),
        Action::Cancel => {
            for task in &report.leaked {
                runtime.request_cancel(task.id);
            }
            let deadline = Instant::now() + config.effective_cancel_grace();
            loop {
                let unsettled: Vec<String> = report
                    .leaked
                    .iter()
                    .filter(|task| runtime.is_task_alive(task.id))
                    .map(crate::report::LeakedTask::display_name)
                    .collect();
                if unsettled.is_empty() {
                    tracing::debug!(
                        target: crate::TARGET,
                        count = report.len(),
                        "cancelled leaked tasks"
                    );
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    report_fault(
                        config.report_sink.as_ref(),
                        &format!(
                            "cancel grace period expired; {} task(s) did not settle: {}",
                            unsettled.len(),
                            unsettled.join(", ")
                        ),
                    );
                    return Ok(());
                }
                yield_now().await;
            }
        }
    }
}

/// Dispatches thread-leak findings. `Cancel` degrades to `Warn`: a running
/// thread cannot be stopped from outside.
pub(crate) fn dispatch_threads(
    report: ThreadLeakReport,
    config: &ThreadLeakConfig,
) -> Result<(), ThreadLeakError> {
    if report.is_empty() {
        return Ok(());
    }
    match config.action {
        Action::Warn => {
            tracing::warn!(
                target: crate::TARGET,
                count = report.len(),
                "{report}"
            );
            Ok(())
        }
        Action::Log => {
            emit_report(config.report_sink.as_ref(), &report.to_string());
            Ok(())
        }
        Action::Cancel => {
            tracing::warn!(
                target: crate::TARGET,
                count = report.len(),
                "cancel degraded to warn (threads cannot be cancelled): {report}"
            );
            Ok(())
        }
        Action::Raise => Err(ThreadLeakError { report }),
    }
}

/// Immediate per-episode dispatch, invoked from the watchdog thread.
///
/// `Raise` is deliberately absent here: an error cannot be surfaced into
/// the monitored code from the watchdog thread, so raised episodes
/// accumulate and come out of scope close instead.
pub(crate) fn report_episode(episode: &BlockEpisode, config: &BlockingConfig) {
    match config.action {
        Action::Warn => {
            tracing::warn!(
                target: crate::TARGET,
                duration = ?episode.duration,
                ping_lost = episode.ping_lost,
                "{episode}"
            );
        }
        Action::Log => {
            emit_report(config.report_sink.as_ref(), &episode.to_string());
        }
        Action::Cancel => {
            tracing::warn!(
                target: crate::TARGET,
                duration = ?episode.duration,
                "cancel degraded to warn (an elapsed blocking episode cannot be cancelled): {episode}"
            );
        }
        Action::Raise => {}
    }
}

/// Close-time dispatch for accumulated blocking episodes. Only `Raise`
/// acts here; the other actions already reported each episode as it was
/// detected.
pub(crate) fn dispatch_block(
    episodes: Vec<BlockEpisode>,
    config: &BlockingConfig,
) -> Result<(), EventLoopBlockError> {
    if episodes.is_empty() {
        return Ok(());
    }
    match config.action {
        Action::Raise => Err(EventLoopBlockError { episodes }),
        Action::Warn | Action::Log | Action::Cancel => Ok(()),
    }
}
