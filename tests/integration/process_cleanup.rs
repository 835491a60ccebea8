//! Timeout and cancellation cleanup.
//!
//! Each test starts a shell script that forks a long-running grandchild
//! and records its pid, then checks that the grandchild is gone once the
//! runner returns.

#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use scanflow::{Error, ProcessRunner};

use crate::fixtures::write_script;

const FORKING_SCRIPT: &str = "echo started\nsleep 30 &\necho \"$!\" > \"$1\"\nwait";

fn read_pid(pid_file: &Path) -> u32 {
    // The script writes the pid before blocking, but give it a moment.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(text) = std::fs::read_to_string(pid_file) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "pid file never written");
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// A process counts as gone once it no longer exists or is a zombie
/// waiting to be reaped by init.
#[cfg(target_os = "linux")]
fn is_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

#[cfg(target_os = "linux")]
async fn assert_gone(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !is_gone(pid) {
        assert!(
            Instant::now() < deadline,
            "descendant process {} still running",
            pid
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Test: Timeout kills the whole tree
/// Given a script whose grandchild sleeps for 30s
/// When the runner times out
/// Then a Timeout error is returned and the grandchild is gone
#[tokio::test]
async fn test_timeout_leaves_no_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fork.sh", FORKING_SCRIPT);
    let pid_file = dir.path().join("child.pid");

    let runner = ProcessRunner::new("fork")
        .with_timeout(Duration::from_millis(500))
        .with_kill_grace(Duration::from_millis(500));
    let started = Instant::now();
    let err = runner
        .run(
            &[script.to_str().unwrap(), pid_file.to_str().unwrap()],
            None,
            None,
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    match &err {
        Error::Timeout { partial, .. } => {
            assert!(partial.timed_out);
            assert!(partial.stdout.contains("started"));
        }
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(err.is_timeout());

    let pid = read_pid(&pid_file);
    #[cfg(target_os = "linux")]
    assert_gone(pid).await;
    let _ = pid;
}

/// Test: Cancellation kills the whole tree
#[tokio::test]
async fn test_cancel_leaves_no_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fork.sh", FORKING_SCRIPT);
    let pid_file = dir.path().join("child.pid");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let runner = ProcessRunner::new("fork").with_kill_grace(Duration::from_millis(500));
    let err = runner
        .run_with_cancel(
            &[script.to_str().unwrap(), pid_file.to_str().unwrap()],
            None,
            None,
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));

    let pid = read_pid(&pid_file);
    #[cfg(target_os = "linux")]
    assert_gone(pid).await;
    let _ = pid;
}

/// Test: Helpers left behind by a tool that exits normally
/// Given a script that backgrounds a sleeper and exits 0
/// Then the run succeeds promptly and the sleeper is gone
#[tokio::test]
async fn test_normal_exit_sweeps_backgrounded_helpers() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "detach.sh",
        "sleep 30 &\necho \"$!\" > \"$1\"\necho done",
    );
    let pid_file = dir.path().join("child.pid");

    let runner = ProcessRunner::new("detach").with_timeout(Duration::from_secs(10));
    let started = Instant::now();
    let result = runner
        .run(
            &[script.to_str().unwrap(), pid_file.to_str().unwrap()],
            None,
            None,
        )
        .await
        .unwrap();

    assert!(result.success());
    assert!(result.stdout.contains("done"));
    assert!(started.elapsed() < Duration::from_secs(5));

    let pid = read_pid(&pid_file);
    #[cfg(target_os = "linux")]
    assert_gone(pid).await;
    let _ = pid;
}

/// Test: Helper that escaped the process group
/// Given a script that prints, starts a setsid sleeper on the same stdout
/// and exits 0
/// Then the run returns within the drain limit and keeps the output
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_escaped_helper_does_not_swallow_output() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "escape.sh",
        "echo hello\nsetsid sleep 5 &\nexit 0",
    );

    let runner = ProcessRunner::new("escape").with_timeout(Duration::from_secs(2));
    let started = Instant::now();
    let result = runner
        .run(&[script.to_str().unwrap()], None, None)
        .await
        .unwrap();

    assert_eq!(result.stdout, "hello");
    assert_eq!(result.exit_code, 0);
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "took {:?}",
        started.elapsed()
    );
}

/// Test: Process that ignores SIGTERM
/// Given a script that traps TERM
/// Then it is force-killed after the grace period
#[tokio::test]
async fn test_sigterm_ignoring_process_is_force_killed() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "stubborn.sh",
        "trap '' TERM\necho ready\nwhile true\ndo\n  sleep 1\ndone",
    );

    let grace = Duration::from_millis(300);
    let runner = ProcessRunner::new("stubborn")
        .with_timeout(Duration::from_millis(300))
        .with_kill_grace(grace);
    let started = Instant::now();
    let err = runner
        .run(&[script.to_str().unwrap()], None, None)
        .await
        .unwrap_err();

    let elapsed = started.elapsed();
    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(600), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
}

/// Test: Synchronous wrapper
#[test]
fn test_run_sync_outside_runtime() {
    let runner = ProcessRunner::new("echo").with_timeout(Duration::from_secs(10));
    let result = runner
        .run_sync(&["echo", "hello world"], None, None)
        .unwrap();
    assert!(result.success());
    assert_eq!(result.stdout, "hello world");
}
