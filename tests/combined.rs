//! Combined-scope e2e suite.
//!
//! All three detectors around one body, with aggregation of raised
//! findings in exit order (threads, blocking, tasks).

use leakscope::test_utils::init_test_logging;
use leakscope::{
    detect_leaks, thread, Action, BlockingConfig, CombinedConfig, Handle, LeakError, NameFilter,
    Runtime, TaskLeakConfig, ThreadLeakConfig,
};
use std::sync::mpsc;
use std::time::Duration;

// ===========================================================================
// HELPERS
// ===========================================================================

/// Raise-everything config. The blocking threshold is deliberately roomy:
/// these tests run in parallel and a descheduled loop must not read as a
/// block. Tests that *want* a block override the blocking config.
fn raise_all(thread_filter: &str) -> CombinedConfig {
    CombinedConfig::new()
        .tasks(TaskLeakConfig::new().action(Action::Raise))
        .threads(
            ThreadLeakConfig::new()
                .action(Action::Raise)
                .name_filter(NameFilter::exact(thread_filter)),
        )
        .blocking(
            BlockingConfig::new(Duration::from_millis(500), Duration::from_millis(50))
                .expect("valid intervals")
                .action(Action::Raise),
        )
}

// ===========================================================================
// CLEAN BODIES
// ===========================================================================

#[test]
fn clean_body_passes_every_detector() {
    init_test_logging();
    let rt = Runtime::new();
    rt.block_on(async {
        let result = detect_leaks(raise_all("combined-clean"), || async {
            let handle = Handle::current().spawn_named("combined-worker", async { 5 });
            assert_eq!(handle.await, Ok(5));
            leakscope::yield_now().await;
        })
        .await;
        assert!(result.is_ok());
    });
}

// ===========================================================================
// AGGREGATION
// ===========================================================================

#[test]
fn thread_and_task_leaks_aggregate_in_exit_order() {
    init_test_logging();
    let rt = Runtime::new();
    rt.block_on(async {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut leaked_thread = None;
        let result = detect_leaks(raise_all("combined-leak"), || {
            let leaked_thread = &mut leaked_thread;
            async move {
                *leaked_thread = Some(
                    thread::Builder::new()
                        .name("combined-leak")
                        .spawn(move || {
                            release_rx
                                .recv_timeout(Duration::from_secs(30))
                                .expect("release signal lost");
                        })
                        .expect("spawn failed"),
                );
                let _detached =
                    Handle::current().spawn_named("combined-orphan", std::future::pending::<()>());
            }
        })
        .await;

        let error = result.expect_err("both leaks must aggregate");
        assert_eq!(error.errors.len(), 2);
        assert!(
            matches!(&error.errors[0], LeakError::Thread(e) if e.report.names() == ["combined-leak"]),
            "threads finalize first"
        );
        assert!(
            matches!(&error.errors[1], LeakError::Task(e) if e.report.names() == ["combined-orphan"]),
            "tasks finalize last"
        );

        release_tx.send(()).expect("leak thread gone");
        leaked_thread
            .expect("body ran")
            .join()
            .expect("leak thread panicked");
    });
}

#[test]
fn blocking_episode_joins_the_aggregate() {
    init_test_logging();
    let rt = Runtime::new();
    rt.block_on(async {
        let config = raise_all("combined-block").blocking(
            BlockingConfig::new(Duration::from_millis(20), Duration::from_millis(10))
                .expect("valid intervals")
                .action(Action::Raise),
        );
        let result = detect_leaks(config, || async {
            std::thread::sleep(Duration::from_millis(200));
        })
        .await;

        let error = result.expect_err("the block must aggregate");
        assert_eq!(error.errors.len(), 1);
        assert!(matches!(&error.errors[0], LeakError::Blocking(e) if !e.episodes.is_empty()));
    });
}

// ===========================================================================
// SELECTIVE DETECTION
// ===========================================================================

#[test]
fn disabled_detectors_observe_nothing() {
    init_test_logging();
    let rt = Runtime::new();
    rt.block_on(async {
        let config = raise_all("combined-disabled")
            .without_tasks()
            .without_blocking();
        let result = detect_leaks(config, || async {
            // Both of these would raise if their detectors were enabled.
            let _detached =
                Handle::current().spawn_named("combined-ignored", std::future::pending::<()>());
            std::thread::sleep(Duration::from_millis(100));
        })
        .await;
        assert!(result.is_ok());
    });
}

#[test]
fn thread_only_combined_scope_works_without_a_runtime() {
    init_test_logging();
    let config = CombinedConfig::new()
        .without_tasks()
        .without_blocking()
        .threads(
            ThreadLeakConfig::new()
                .action(Action::Raise)
                .name_filter(NameFilter::exact("combined-no-runtime")),
        );
    let scope = leakscope::CombinedScope::enter(config);
    // No runtime on this thread; close still needs one only for task
    // detection, which is disabled.
    let rt = Runtime::new();
    let result = rt.block_on(async { scope.close().await });
    assert!(result.is_ok());
}

// ===========================================================================
// RETURN VALUE
// ===========================================================================

#[test]
fn wrapper_preserves_the_body_return_value() {
    init_test_logging();
    let rt = Runtime::new();
    let value = rt.block_on(async {
        detect_leaks(
            CombinedConfig::new().without_blocking(),
            || async { vec![1, 2, 3] },
        )
        .await
        .expect("clean body")
    });
    assert_eq!(value, vec![1, 2, 3]);
}
