//! Thread-leak detection e2e suite.
//!
//! The registry is process-wide and these tests run in parallel within one
//! binary, so every assertion-sensitive scope pins down its own threads
//! with a name filter.

use leakscope::test_utils::init_test_logging;
use leakscope::{
    detect_thread_leaks, thread, Action, NameFilter, ReportSink, ThreadLeakConfig,
    ThreadLeakScope,
};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

// ===========================================================================
// HELPERS
// ===========================================================================

fn collecting_sink() -> (ReportSink, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = Arc::clone(&lines);
    let sink: ReportSink = Arc::new(move |message: &str| {
        sink_lines.lock().push(message.to_string());
    });
    (sink, lines)
}

/// Spawns a thread that parks until released, so the test controls exactly
/// when it stops being a leak.
fn parked_thread(
    name: &str,
    daemon: bool,
) -> (std::thread::JoinHandle<()>, mpsc::Sender<()>) {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name(name)
        .daemon(daemon)
        .spawn(move || {
            release_rx
                .recv_timeout(Duration::from_secs(30))
                .expect("release signal lost");
        })
        .expect("spawn failed");
    (handle, release_tx)
}

// ===========================================================================
// CLEAN SCOPES
// ===========================================================================

#[test]
fn empty_scope_reports_nothing() {
    init_test_logging();
    let config = ThreadLeakConfig::new()
        .action(Action::Raise)
        .name_filter(NameFilter::pattern("^never-spawned-").expect("valid pattern"));
    let result = detect_thread_leaks(config, || {});
    assert!(result.is_ok());
}

#[test]
fn joined_thread_is_not_a_finding() {
    init_test_logging();
    let config = ThreadLeakConfig::new()
        .action(Action::Raise)
        .name_filter(NameFilter::exact("joined-before-exit"));
    let result = detect_thread_leaks(config, || {
        let handle = thread::spawn_named("joined-before-exit", || {});
        handle.join().expect("worker panicked");
    });
    assert!(result.is_ok());
}

#[test]
fn thread_alive_at_enter_is_never_reported() {
    init_test_logging();
    let (handle, release) = parked_thread("baseline-resident", false);

    let config = ThreadLeakConfig::new()
        .action(Action::Raise)
        .name_filter(NameFilter::exact("baseline-resident"));
    let result = detect_thread_leaks(config, || {});
    assert!(result.is_ok());

    release.send(()).expect("resident gone");
    handle.join().expect("resident panicked");
}

// ===========================================================================
// LEAKED THREADS
// ===========================================================================

#[test]
fn leaked_thread_reports_once_and_keeps_running() {
    init_test_logging();
    let (sink, lines) = collecting_sink();
    let config = ThreadLeakConfig::new()
        .action(Action::Log)
        .report_sink(sink)
        .name_filter(NameFilter::exact("sleeper-10s"));

    let mut released: Option<(std::thread::JoinHandle<()>, mpsc::Sender<()>)> = None;
    let result = detect_thread_leaks(config, || {
        released = Some(parked_thread("sleeper-10s", false));
    });
    assert!(result.is_ok(), "log never raises");

    {
        let lines = lines.lock();
        assert_eq!(lines.len(), 1, "exactly one report");
        assert!(lines[0].contains("sleeper-10s"));
    }

    // The scope neither joins nor kills the leak.
    let (handle, release) = released.expect("body ran");
    assert!(!handle.is_finished(), "the leaked thread must keep running");
    release.send(()).expect("sleeper gone");
    handle.join().expect("sleeper panicked");
}

#[test]
fn leaked_thread_raises_with_its_name() {
    init_test_logging();
    let config = ThreadLeakConfig::new()
        .action(Action::Raise)
        .name_filter(NameFilter::exact("raising-leak"));

    let mut released: Option<(std::thread::JoinHandle<()>, mpsc::Sender<()>)> = None;
    let result = detect_thread_leaks(config, || {
        released = Some(parked_thread("raising-leak", false));
    });

    let error = result.expect_err("leak must raise");
    assert_eq!(error.report.names(), vec!["raising-leak".to_string()]);

    let (handle, release) = released.expect("body ran");
    release.send(()).expect("leak gone");
    handle.join().expect("leak panicked");
}

#[test]
fn cancel_degrades_to_warn_for_threads() {
    init_test_logging();
    let config = ThreadLeakConfig::new()
        .action(Action::Cancel)
        .name_filter(NameFilter::exact("undegradable"));

    let mut released: Option<(std::thread::JoinHandle<()>, mpsc::Sender<()>)> = None;
    let result = detect_thread_leaks(config, || {
        released = Some(parked_thread("undegradable", false));
    });
    assert!(result.is_ok(), "degraded cancel never raises");

    let (handle, release) = released.expect("body ran");
    assert!(!handle.is_finished(), "degraded cancel must not touch the thread");
    release.send(()).expect("thread gone");
    handle.join().expect("thread panicked");
}

// ===========================================================================
// DAEMON MARKER
// ===========================================================================

#[test]
fn daemon_thread_excluded_by_default() {
    init_test_logging();
    let config = ThreadLeakConfig::new()
        .action(Action::Raise)
        .name_filter(NameFilter::exact("daemon-default"));

    let mut released: Option<(std::thread::JoinHandle<()>, mpsc::Sender<()>)> = None;
    let result = detect_thread_leaks(config, || {
        released = Some(parked_thread("daemon-default", true));
    });
    assert!(result.is_ok(), "daemons are excluded by default");

    let (handle, release) = released.expect("body ran");
    release.send(()).expect("daemon gone");
    handle.join().expect("daemon panicked");
}

#[test]
fn daemon_thread_included_when_exclusion_disabled() {
    init_test_logging();
    let config = ThreadLeakConfig::new()
        .action(Action::Raise)
        .exclude_daemon(false)
        .name_filter(NameFilter::exact("daemon-included"));

    let mut released: Option<(std::thread::JoinHandle<()>, mpsc::Sender<()>)> = None;
    let result = detect_thread_leaks(config, || {
        released = Some(parked_thread("daemon-included", true));
    });

    let error = result.expect_err("daemon leak must raise when included");
    assert_eq!(error.report.len(), 1);
    assert!(error.report.leaked[0].daemon);

    let (handle, release) = released.expect("body ran");
    release.send(()).expect("daemon gone");
    handle.join().expect("daemon panicked");
}

// ===========================================================================
// PANIC PRIORITY AND LIFECYCLE
// ===========================================================================

#[test]
fn body_panic_propagates_and_findings_fall_back_to_the_log_path() {
    init_test_logging();
    let (sink, lines) = collecting_sink();
    let config = ThreadLeakConfig::new()
        .action(Action::Raise)
        .report_sink(sink)
        .name_filter(NameFilter::exact("panic-witness"));

    let released: Arc<Mutex<Option<(std::thread::JoinHandle<()>, mpsc::Sender<()>)>>> =
        Arc::new(Mutex::new(None));
    let body_released = Arc::clone(&released);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _: Result<(), _> = detect_thread_leaks(config, || {
            *body_released.lock() = Some(parked_thread("panic-witness", false));
            panic!("thread body exploded");
        });
    }));
    assert!(outcome.is_err(), "the body panic must propagate");

    {
        let lines = lines.lock();
        assert_eq!(lines.len(), 1, "findings must surface exactly once, via log");
        assert!(lines[0].contains("panic-witness"));
    }

    let (handle, release) = released.lock().take().expect("body ran");
    release.send(()).expect("witness gone");
    handle.join().expect("witness panicked");
}

#[test]
fn dropping_a_scope_without_close_is_non_fatal() {
    init_test_logging();
    let scope = ThreadLeakScope::enter(ThreadLeakConfig::new().action(Action::Raise));
    drop(scope);
}

#[test]
fn wrapper_preserves_the_body_return_value() {
    init_test_logging();
    let config = ThreadLeakConfig::new()
        .name_filter(NameFilter::pattern("^never-spawned-").expect("valid pattern"));
    let value = detect_thread_leaks(config, || 99).expect("clean body");
    assert_eq!(value, 99);
}
