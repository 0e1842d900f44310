//! Integration tests for spawning children on a real PTY

use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe, Pid};

use mochi_pty::spawn::NoScope;
use mochi_pty::{Cancellable, Packet, Pty, PtyFlags, PtyHandle, SpawnConfig, SpawnError, SpawnOperation, WaitPool};

fn new_pty() -> PtyHandle {
    Arc::new(Pty::create(PtyFlags::no_accounting()).expect("Failed to create PTY"))
}

fn operation(config: SpawnConfig) -> SpawnOperation {
    SpawnOperation::new(config)
        .expect("Invalid spawn config")
        .scope_manager(Arc::new(NoScope))
        .timeout(Some(Duration::from_secs(10)))
}

/// Collect terminal output until `needle` shows up or the timeout expires
fn read_until(pty: &Pty, needle: &str, timeout_ms: u64) -> String {
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    while Instant::now() < deadline {
        if String::from_utf8_lossy(&output).contains(needle) {
            break;
        }
        if pty.poll_read(50).unwrap_or(false) {
            match pty.read_packet(&mut buf) {
                Ok(Packet::Data(0)) => break,
                Ok(Packet::Data(n)) => output.extend_from_slice(&buf[..n]),
                Ok(_) => {},
                Err(_) => break,
            }
        }
    }

    String::from_utf8_lossy(&output).into_owned()
}

fn wait_status(pid: Pid) -> WaitStatus {
    loop {
        match waitpid(pid, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => return status,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => panic!("waitpid failed: {}", e),
        }
    }
}

/// Exit code of `pid`, or -1 if a signal killed it
///
/// Callers must keep a handle on the PTY until this returns; closing the
/// last master hangs up the child.
fn wait_exit(pid: Pid) -> i32 {
    match wait_status(pid) {
        WaitStatus::Exited(_, code) => code,
        _ => -1,
    }
}

// ============================================================================
// Successful spawns
// ============================================================================

#[test]
fn test_spawn_true_returns_pid() {
    let pty = new_pty();
    let pid = operation(SpawnConfig::new(Arc::clone(&pty), ["/bin/true"]))
        .run_sync()
        .expect("Failed to spawn /bin/true");
    assert!(pid.as_raw() > 0);
    assert_eq!(wait_exit(pid), 0);
}

#[test]
fn test_spawn_searches_path() {
    let pty = new_pty();
    let pid = operation(SpawnConfig::new(Arc::clone(&pty), ["true"]).search_path(true))
        .run_sync()
        .expect("Failed to spawn true from PATH");
    assert_eq!(wait_exit(pid), 0);
}

#[test]
fn test_child_output_reaches_master() {
    let pty = new_pty();
    let pid = operation(SpawnConfig::new(Arc::clone(&pty), ["/bin/sh", "-c", "echo mochi-spawn-ok"]))
        .run_sync()
        .expect("Failed to spawn sh");

    let output = read_until(&pty, "mochi-spawn-ok", 5000);
    assert!(output.contains("mochi-spawn-ok"), "output was {:?}", output);
    assert_eq!(wait_exit(pid), 0);
}

#[test]
fn test_child_sees_terminal_environment() {
    let pty = new_pty();
    let config = SpawnConfig::new(Arc::clone(&pty), ["/bin/sh", "-c", "echo \"[$TERM|$COLORTERM|$MOCHI_EXTRA]\""])
        .env("MOCHI_EXTRA", "yes");
    let pid = operation(config).run_sync().expect("Failed to spawn sh");

    let output = read_until(&pty, "]", 5000);
    assert!(output.contains("[xterm-256color|truecolor|yes]"), "output was {:?}", output);
    wait_exit(pid);
}

#[test]
fn test_fallback_directory_used() {
    let fallback = tempfile::tempdir().expect("Failed to create temp dir");
    let fallback_path = fallback.path().canonicalize().expect("Failed to canonicalize");
    let marker = fallback_path.join("marker");

    let pty = new_pty();
    let config = SpawnConfig::new(Arc::clone(&pty), ["/bin/sh", "-c", "pwd -P > marker"])
        .current_dir("/nonexistent/mochi-spawn-test")
        .fallback_dir(&fallback_path);
    let pid = operation(config).run_sync().expect("Failed to spawn with fallback");
    assert_eq!(wait_exit(pid), 0);

    let written = std::fs::read_to_string(&marker).expect("Child did not write marker");
    assert_eq!(written.trim(), fallback_path.to_string_lossy());
}

#[test]
fn test_mapped_fd_reaches_child() {
    let (read_end, write_end) = pipe().expect("Failed to create pipe");

    let pty = new_pty();
    let config = SpawnConfig::new(Arc::clone(&pty), ["/bin/sh", "-c", "echo mapped >&5"]).map_fd(write_end, 5);
    let pid = operation(config).run_sync().expect("Failed to spawn with mapped fd");
    assert_eq!(wait_exit(pid), 0);

    let mut output = String::new();
    File::from(read_end)
        .read_to_string(&mut output)
        .expect("Failed to read pipe");
    assert_eq!(output, "mapped\n");
}

#[test]
fn test_child_setup_runs_before_exec() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let marker = dir.path().join("setup-ran");
    let marker_for_child = marker.clone();

    let pty = new_pty();
    let config = SpawnConfig::new(Arc::clone(&pty), ["/bin/true"]).child_setup(move || {
        let _ = File::create(&marker_for_child);
    });
    let pid = operation(config).run_sync().expect("Failed to spawn with setup");
    assert_eq!(wait_exit(pid), 0);
    assert!(marker.exists());
}

// ============================================================================
// Failures reported by the child
// ============================================================================

#[test]
fn test_missing_program_reports_exec_error() {
    let pty = new_pty();
    let err = operation(SpawnConfig::new(pty, ["/nonexistent/mochi-no-such-program"]))
        .run_sync()
        .expect_err("Spawn should fail");
    match err {
        SpawnError::Exec { arg0, errno } => {
            assert_eq!(arg0, "/nonexistent/mochi-no-such-program");
            assert_eq!(errno, Errno::ENOENT);
        },
        other => panic!("Unexpected error: {:?}", other),
    }
}

#[test]
fn test_unreachable_directories_report_primary_chdir_error() {
    // A regular file as fallback fails with ENOTDIR, unlike the primary
    let fallback = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    let pty = new_pty();
    let config = SpawnConfig::new(pty, ["/bin/true"])
        .current_dir("/nonexistent/mochi-primary")
        .fallback_dir(fallback.path());
    let err = operation(config).run_sync().expect_err("Spawn should fail");
    match err {
        SpawnError::Chdir { dir, errno, .. } => {
            assert_eq!(dir.to_str(), Some("/nonexistent/mochi-primary"));
            assert_eq!(errno, Errno::ENOENT);
        },
        other => panic!("Unexpected error: {:?}", other),
    }
}

#[test]
fn test_invalid_fd_target_rejected_up_front() {
    let (_read_end, write_end): (OwnedFd, OwnedFd) = pipe().expect("Failed to create pipe");
    let pty = new_pty();
    let config = SpawnConfig::new(pty, ["/bin/true"]).map_fd(write_end, 1);
    assert!(matches!(SpawnOperation::new(config), Err(SpawnError::InvalidConfig(_))));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_drop_after_prepare_reaps_child() {
    let pty = new_pty();
    let mut op = operation(SpawnConfig::new(pty, ["sleep", "30"]).search_path(true));
    op.prepare().expect("Failed to prepare");
    let pid = op.pid().expect("No pid after prepare");
    drop(op);

    assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
}

#[test]
fn test_abandoned_child_dies_of_sighup() {
    let pty = new_pty();
    let mut op = operation(SpawnConfig::new(Arc::clone(&pty), ["sleep", "30"]).search_path(true));
    op.prepare().expect("Failed to prepare");
    let pid = op.pid().expect("No pid after prepare");

    match op.abandon() {
        Some(WaitStatus::Signaled(reaped, Signal::SIGHUP, _)) => assert_eq!(reaped, pid),
        other => panic!("Unexpected status: {:?}", other),
    }
    assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
}

#[test]
fn test_abandoned_child_ignoring_sighup_is_killed() {
    let pty = new_pty();
    let config = SpawnConfig::new(Arc::clone(&pty), ["/bin/true"]).child_setup(|| {
        // SAFETY: SIG_IGN installs no handler code
        let _ = unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) };
        std::thread::sleep(Duration::from_secs(5));
    });
    let mut op = operation(config).timeout(Some(Duration::from_millis(500)));
    op.prepare().expect("Failed to prepare");
    assert!(matches!(op.run(), Err(SpawnError::TimedOut)));

    assert!(matches!(op.abandon(), Some(WaitStatus::Signaled(_, Signal::SIGKILL, _))));
}

#[test]
fn test_dropping_last_handle_hangs_up_child() {
    let pid = operation(SpawnConfig::new(new_pty(), ["sleep", "30"]).search_path(true))
        .run_sync()
        .expect("Failed to spawn sleep");
    assert!(matches!(wait_status(pid), WaitStatus::Signaled(_, Signal::SIGHUP, _)));
}

#[test]
fn test_prepare_twice_is_rejected() {
    let pty = new_pty();
    let mut op = operation(SpawnConfig::new(Arc::clone(&pty), ["/bin/true"]));
    op.prepare().expect("Failed to prepare");
    assert!(matches!(op.prepare(), Err(SpawnError::InvalidState(_))));
    let pid = op.run().expect("Failed to run");
    wait_exit(pid);
}

#[test]
fn test_timeout_while_child_is_stuck() {
    let pty = new_pty();
    let config = SpawnConfig::new(pty, ["/bin/true"]).child_setup(|| {
        std::thread::sleep(Duration::from_secs(5));
    });
    let mut op = operation(config).timeout(Some(Duration::from_millis(100)));
    op.prepare().expect("Failed to prepare");
    let pid = op.pid().expect("No pid after prepare");

    let started = Instant::now();
    assert!(matches!(op.run(), Err(SpawnError::TimedOut)));
    assert!(started.elapsed() < Duration::from_secs(4));

    drop(op);
    assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
}

#[test]
fn test_cancelled_before_run() {
    let cancellable = Cancellable::new().expect("Failed to create cancellable");
    cancellable.cancel();

    let pty = new_pty();
    let config = SpawnConfig::new(pty, ["sleep", "30"]).search_path(true);
    let err = operation(config).cancellable(cancellable).run_sync().expect_err("Spawn should be cancelled");
    assert!(matches!(err, SpawnError::Cancelled));
}

#[test]
fn test_run_async_delivers_result() {
    let pool = WaitPool::new(2).expect("Failed to create pool");
    let (tx, rx) = mpsc::channel();

    let ok_pty = new_pty();
    let ok = operation(SpawnConfig::new(Arc::clone(&ok_pty), ["/bin/true"]));
    let tx_ok = tx.clone();
    ok.run_async(&pool, move |result| {
        let _ = tx_ok.send(("ok", result));
    });

    let bad = operation(SpawnConfig::new(new_pty(), ["/nonexistent/mochi-async"]));
    bad.run_async(&pool, move |result| {
        let _ = tx.send(("bad", result));
    });

    for _ in 0..2 {
        let (which, result) = rx.recv_timeout(Duration::from_secs(10)).expect("No callback");
        match which {
            "ok" => {
                let pid = result.expect("Async spawn failed");
                assert_eq!(wait_exit(pid), 0);
            },
            _ => assert!(matches!(result, Err(SpawnError::Exec { .. }))),
        }
    }
}
