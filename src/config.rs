//! Detector configuration.
//!
//! Each detector takes its own configuration struct ([`TaskLeakConfig`],
//! [`ThreadLeakConfig`], [`BlockingConfig`]); [`CombinedConfig`] bundles all
//! three for [`crate::scope::CombinedScope`]. Everything that can be invalid
//! is validated here, at construction: an invalid filter pattern or an
//! interval ordering violation is a [`ConfigError`] immediately, never a
//! deferred detection-time failure.

use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long the `Cancel` action waits for cancelled tasks to settle before
/// falling back to the log path.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Default event-loop responsiveness threshold.
pub const DEFAULT_BLOCK_THRESHOLD: Duration = Duration::from_millis(100);

/// Default cadence at which the watchdog probes the event loop.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Sink for the `Log` action and for internal-fault reports.
///
/// Defaults to a `tracing` warning on the crate target when unset.
pub type ReportSink = Arc<dyn Fn(&str) + Send + Sync>;

/// What to do with detection findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Emit a non-fatal warning event and continue.
    #[default]
    Warn,
    /// Write a summary through the configured report sink and continue.
    Log,
    /// Best-effort cancel leaked tasks, then continue. Degrades to `Warn`
    /// for thread and blocking findings, which cannot be cancelled.
    Cancel,
    /// Return the finding-kind-specific error from scope close.
    Raise,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warn => f.write_str("warn"),
            Self::Log => f.write_str("log"),
            Self::Cancel => f.write_str("cancel"),
            Self::Raise => f.write_str("raise"),
        }
    }
}

/// Filter applied to resource display names before a finding is reported.
///
/// An omitted filter (the `None` in `Option<NameFilter>`) matches every
/// resource, named or not. Both variants here require a present name: a
/// resource with no display name never matches an explicit filter.
#[derive(Debug, Clone)]
pub enum NameFilter {
    /// Case-sensitive equality against the full display name.
    Exact(String),
    /// Matches if the pattern finds any match within the display name.
    Pattern(Regex),
}

impl NameFilter {
    /// Exact-match filter.
    pub fn exact(name: impl Into<String>) -> Self {
        Self::Exact(name.into())
    }

    /// Compiled-pattern filter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] if `pattern` is not a valid
    /// regular expression.
    pub fn pattern(pattern: &str) -> Result<Self, ConfigError> {
        match Regex::new(pattern) {
            Ok(re) => Ok(Self::Pattern(re)),
            Err(source) => Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }),
        }
    }

    pub(crate) fn matches(&self, name: Option<&str>) -> bool {
        let Some(name) = name else {
            return false;
        };
        match self {
            Self::Exact(expected) => expected == name,
            Self::Pattern(re) => re.is_match(name),
        }
    }
}

/// Configuration error, raised at construction time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The name-filter pattern failed to compile.
    #[error("invalid name filter pattern `{pattern}`: {source}")]
    InvalidPattern {
        /// The rejected pattern text.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },
    /// `check_interval` exceeds `threshold`, which would make every probe
    /// cycle report a blocking episode.
    #[error("check_interval ({check_interval:?}) must not exceed threshold ({threshold:?})")]
    IntervalExceedsThreshold {
        /// The configured threshold.
        threshold: Duration,
        /// The offending check interval.
        check_interval: Duration,
    },
}

/// Configuration for task-leak detection.
#[derive(Clone, Default)]
pub struct TaskLeakConfig {
    /// Action applied to findings.
    pub action: Action,
    /// Optional display-name filter.
    pub name_filter: Option<NameFilter>,
    /// Capture a spawn-site backtrace for tasks created inside the scope
    /// and attach it to leak findings. Off by default; capture is not free.
    pub track_creation: bool,
    /// Sink for the `Log` action and fallback reports.
    pub report_sink: Option<ReportSink>,
    cancel_grace: Option<Duration>,
}

impl TaskLeakConfig {
    /// Configuration with all defaults (action `Warn`, no filter).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the action applied to findings.
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Sets the display-name filter.
    #[must_use]
    pub fn name_filter(mut self, filter: NameFilter) -> Self {
        self.name_filter = Some(filter);
        self
    }

    /// Enables spawn-site backtrace capture for tasks created in the scope.
    #[must_use]
    pub fn track_creation(mut self, enabled: bool) -> Self {
        self.track_creation = enabled;
        self
    }

    /// Overrides the `Cancel` settlement grace period.
    #[must_use]
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = Some(grace);
        self
    }

    /// Sets the sink for the `Log` action and fallback reports.
    #[must_use]
    pub fn report_sink(mut self, sink: ReportSink) -> Self {
        self.report_sink = Some(sink);
        self
    }

    /// The effective `Cancel` grace period.
    #[must_use]
    pub fn effective_cancel_grace(&self) -> Duration {
        self.cancel_grace.unwrap_or(DEFAULT_CANCEL_GRACE)
    }
}

impl fmt::Debug for TaskLeakConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLeakConfig")
            .field("action", &self.action)
            .field("name_filter", &self.name_filter)
            .field("track_creation", &self.track_creation)
            .field("cancel_grace", &self.effective_cancel_grace())
            .field("report_sink", &self.report_sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

/// Configuration for thread-leak detection.
#[derive(Clone)]
pub struct ThreadLeakConfig {
    /// Action applied to findings.
    pub action: Action,
    /// Optional display-name filter.
    pub name_filter: Option<NameFilter>,
    /// Ignore threads registered with the daemon marker. Defaults to true:
    /// daemon threads are declared background/expendable by their spawner.
    pub exclude_daemon: bool,
    /// Sink for the `Log` action and fallback reports.
    pub report_sink: Option<ReportSink>,
}

impl ThreadLeakConfig {
    /// Configuration with all defaults (action `Warn`, daemons excluded).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the action applied to findings.
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Sets the display-name filter.
    #[must_use]
    pub fn name_filter(mut self, filter: NameFilter) -> Self {
        self.name_filter = Some(filter);
        self
    }

    /// Controls whether daemon-marked threads are ignored.
    #[must_use]
    pub fn exclude_daemon(mut self, exclude: bool) -> Self {
        self.exclude_daemon = exclude;
        self
    }

    /// Sets the sink for the `Log` action and fallback reports.
    #[must_use]
    pub fn report_sink(mut self, sink: ReportSink) -> Self {
        self.report_sink = Some(sink);
        self
    }
}

impl Default for ThreadLeakConfig {
    fn default() -> Self {
        Self {
            action: Action::default(),
            name_filter: None,
            exclude_daemon: true,
            report_sink: None,
        }
    }
}

impl fmt::Debug for ThreadLeakConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLeakConfig")
            .field("action", &self.action)
            .field("name_filter", &self.name_filter)
            .field("exclude_daemon", &self.exclude_daemon)
            .field("report_sink", &self.report_sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

/// Configuration for event-loop blocking detection.
///
/// `threshold` and `check_interval` are only settable through the fallible
/// [`BlockingConfig::new`], which enforces `check_interval <= threshold`.
#[derive(Clone)]
pub struct BlockingConfig {
    /// Action applied to findings.
    pub action: Action,
    /// Sink for the `Log` action and fallback reports.
    pub report_sink: Option<ReportSink>,
    threshold: Duration,
    check_interval: Duration,
}

impl BlockingConfig {
    /// Configuration with an explicit threshold and check interval.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IntervalExceedsThreshold`] when
    /// `check_interval > threshold`.
    pub fn new(threshold: Duration, check_interval: Duration) -> Result<Self, ConfigError> {
        if check_interval > threshold {
            return Err(ConfigError::IntervalExceedsThreshold {
                threshold,
                check_interval,
            });
        }
        Ok(Self {
            action: Action::default(),
            report_sink: None,
            threshold,
            check_interval,
        })
    }

    /// Sets the action applied to findings.
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Sets the sink for the `Log` action and fallback reports.
    #[must_use]
    pub fn report_sink(mut self, sink: ReportSink) -> Self {
        self.report_sink = Some(sink);
        self
    }

    /// The latency above which a probe cycle counts as a blocking episode.
    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// The cadence at which the watchdog probes the loop.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            action: Action::default(),
            report_sink: None,
            threshold: DEFAULT_BLOCK_THRESHOLD,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl fmt::Debug for BlockingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingConfig")
            .field("action", &self.action)
            .field("threshold", &self.threshold)
            .field("check_interval", &self.check_interval)
            .field("report_sink", &self.report_sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

/// Bundle of per-kind configurations for combined detection.
///
/// A `None` entry disables that detector entirely. The default enables all
/// three with their individual defaults.
#[derive(Debug, Clone)]
pub struct CombinedConfig {
    /// Task-leak detection, or `None` to disable.
    pub tasks: Option<TaskLeakConfig>,
    /// Thread-leak detection, or `None` to disable.
    pub threads: Option<ThreadLeakConfig>,
    /// Event-loop blocking detection, or `None` to disable.
    pub blocking: Option<BlockingConfig>,
}

impl CombinedConfig {
    /// All three detectors enabled with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the task-leak configuration.
    #[must_use]
    pub fn tasks(mut self, config: TaskLeakConfig) -> Self {
        self.tasks = Some(config);
        self
    }

    /// Replaces the thread-leak configuration.
    #[must_use]
    pub fn threads(mut self, config: ThreadLeakConfig) -> Self {
        self.threads = Some(config);
        self
    }

    /// Replaces the blocking configuration.
    #[must_use]
    pub fn blocking(mut self, config: BlockingConfig) -> Self {
        self.blocking = Some(config);
        self
    }

    /// Disables task-leak detection.
    #[must_use]
    pub fn without_tasks(mut self) -> Self {
        self.tasks = None;
        self
    }

    /// Disables thread-leak detection.
    #[must_use]
    pub fn without_threads(mut self) -> Self {
        self.threads = None;
        self
    }

    /// Disables blocking detection.
    #[must_use]
    pub fn without_blocking(mut self) -> Self {
        self.blocking = None;
        self
    }
}

impl Default for CombinedConfig {
    fn default() -> Self {
        Self {
            tasks: Some(TaskLeakConfig::default()),
            threads: Some(ThreadLeakConfig::default()),
            blocking: Some(BlockingConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_filter_matches_everything() {
        let filter: Option<NameFilter> = None;
        assert!(filter.as_ref().map_or(true, |f| f.matches(Some("worker"))));
        assert!(filter.as_ref().map_or(true, |f| f.matches(None)));
    }

    #[test]
    fn exact_filter_is_case_sensitive() {
        let filter = NameFilter::exact("worker");
        assert!(filter.matches(Some("worker")));
        assert!(!filter.matches(Some("Worker")));
        assert!(!filter.matches(Some("worker-1")));
    }

    #[test]
    fn unnamed_never_matches_explicit_filter() {
        assert!(!NameFilter::exact("worker").matches(None));
        let pattern = NameFilter::pattern("work").expect("valid pattern");
        assert!(!pattern.matches(None));
    }

    #[test]
    fn pattern_filter_finds_anywhere() {
        let filter = NameFilter::pattern("work(er)?-\\d+").expect("valid pattern");
        assert!(filter.matches(Some("worker-12")));
        assert!(filter.matches(Some("pool/work-3/reader")));
        assert!(!filter.matches(Some("worker")));
    }

    #[test]
    fn invalid_pattern_rejected_at_construction() {
        let err = NameFilter::pattern("work(er").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
        assert!(err.to_string().contains("work(er"));
    }

    #[test]
    fn interval_must_not_exceed_threshold() {
        let err = BlockingConfig::new(Duration::from_millis(10), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, ConfigError::IntervalExceedsThreshold { .. }));

        let ok = BlockingConfig::new(Duration::from_millis(20), Duration::from_millis(20));
        assert!(ok.is_ok());
    }

    #[test]
    fn defaults_are_valid() {
        let config = BlockingConfig::default();
        assert!(config.check_interval() <= config.threshold());
        assert_eq!(config.action, Action::Warn);

        let combined = CombinedConfig::default();
        assert!(combined.tasks.is_some());
        assert!(combined.threads.is_some());
        assert!(combined.blocking.is_some());
    }
}
