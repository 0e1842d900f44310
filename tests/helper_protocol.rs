//! Integration tests for the helper protocol, with the session running in a
//! thread of the test process

use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{pipe, write};

use mochi_pty::helper::protocol::{read_exact, write_int};
use mochi_pty::helper::{
    AllocatedPty, Database, Databases, EntryKind, HelperClient, HelperSession, Identity, Opcode,
    PrivilegedAllocator, PtyAllocator, RecordingAccounting,
};
use mochi_pty::spawn::NoScope;
use mochi_pty::{HelperError, Packet, Pty, PtyError, PtyFlags, SpawnConfig, SpawnOperation};

fn channel() -> (OwnedFd, OwnedFd) {
    socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).expect("Failed to create socketpair")
}

/// Allocator that always fails, as if the system ran out of PTYs
struct ExhaustedAllocator;

impl PtyAllocator for ExhaustedAllocator {
    fn allocate(&mut self, _identity: &Identity) -> Result<AllocatedPty, HelperError> {
        Err(HelperError::Allocate(nix::errno::Errno::EAGAIN))
    }
}

/// Start a session thread; it returns how many records were still open
/// when the client went away
fn start_session<P>(allocator: P) -> (HelperClient, RecordingAccounting, JoinHandle<usize>)
where
    P: PtyAllocator + Send + 'static,
{
    let (client_control, helper_control) = channel();
    let (client_fdpass, helper_fdpass) = channel();
    let accounting = RecordingAccounting::new();
    let recorder = accounting.clone();

    let handle = thread::spawn(move || {
        let identity = Identity::resolve_with(None, None);
        let mut session = HelperSession::new(helper_control, helper_fdpass, identity, recorder, allocator);
        let stop = AtomicBool::new(false);
        let _ = session.serve(&stop, None);
        session.open_records()
    });

    (HelperClient::from_fds(client_control, client_fdpass), accounting, handle)
}

// ============================================================================
// Open and close
// ============================================================================

#[test]
fn test_open_close_writes_login_and_logout() {
    let (mut client, accounting, handle) = start_session(PrivilegedAllocator::new("tty"));

    let opened = client.open(Databases::ALL).expect("Failed to open PTY");
    assert!(opened.token.0 >= 1);
    client.close(opened.token).expect("Failed to close PTY");
    client.synch().expect("Failed to synch");

    for database in [Database::Utmp, Database::Wtmp, Database::Lastlog] {
        assert_eq!(accounting.count(database, EntryKind::Login), 1, "{:?}", database);
        assert_eq!(accounting.count(database, EntryKind::Logout), 1, "{:?}", database);
    }

    drop(client);
    assert_eq!(handle.join().expect("Session panicked"), 0);
}

#[test]
fn test_open_pty_adopts_master() {
    let (mut client, accounting, handle) = start_session(PrivilegedAllocator::new("tty"));

    let flags = PtyFlags {
        no_lastlog: true,
        ..Default::default()
    };
    let (pty, _peer, token) = client.open_pty(flags).expect("Failed to open PTY");
    assert!(pty.peer_name().expect("No peer name").starts_with("/dev/"));
    client.synch().expect("Failed to synch");

    assert_eq!(accounting.count(Database::Utmp, EntryKind::Login), 1);
    assert_eq!(accounting.count(Database::Lastlog, EntryKind::Login), 0);

    client.close(token).expect("Failed to close PTY");
    drop(client);
    assert_eq!(handle.join().expect("Session panicked"), 0);
}

#[test]
fn test_tokens_are_distinct() {
    let (mut client, _accounting, handle) = start_session(PrivilegedAllocator::new("tty"));

    let first = client.open(Databases::NONE).expect("Failed to open first PTY");
    let second = client.open(Databases::NONE).expect("Failed to open second PTY");
    assert_ne!(first.token, second.token);

    client.close(first.token).expect("Failed to close");
    client.close(second.token).expect("Failed to close");
    drop(client);
    assert_eq!(handle.join().expect("Session panicked"), 0);
}

/// Drain the master until it reports end of stream or `timeout` expires
fn drained_to_end(pty: &Pty, timeout: Duration) -> bool {
    let mut buf = [0u8; 1024];
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pty.poll_read(50).unwrap_or(false) {
            continue;
        }
        match pty.read_packet(&mut buf) {
            Ok(Packet::Data(0)) | Err(PtyError::Read(Errno::EIO)) => return true,
            Ok(_) => {},
            Err(e) => panic!("Unexpected read error: {}", e),
        }
    }
    false
}

#[test]
fn test_helper_pty_reaches_end_of_stream_after_child_exits() {
    let (mut client, _accounting, handle) = start_session(PrivilegedAllocator::new("tty"));
    let (pty, peer, token) = client.open_pty(PtyFlags::no_accounting()).expect("Failed to open PTY");
    let pty = Arc::new(pty);

    let pid = SpawnOperation::new(SpawnConfig::new(Arc::clone(&pty), ["/bin/true"]))
        .expect("Invalid spawn config")
        .scope_manager(Arc::new(NoScope))
        .timeout(Some(Duration::from_secs(10)))
        .run_sync()
        .expect("Failed to spawn /bin/true");
    // The child holds its own peer now; ours would keep the master alive
    drop(peer);

    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => panic!("waitpid failed: {}", e),
        }
    }
    assert!(drained_to_end(&pty, Duration::from_secs(2)), "master never reported end of stream");

    client.close(token).expect("Failed to close PTY");
    drop(client);
    assert_eq!(handle.join().expect("Session panicked"), 0);
}

// ============================================================================
// Shutdown and failures
// ============================================================================

#[test]
fn test_disconnect_flushes_open_records() {
    let (mut client, accounting, handle) = start_session(PrivilegedAllocator::new("tty"));

    client.open(Databases::ALL).expect("Failed to open PTY");
    client.open(Databases::ALL).expect("Failed to open PTY");
    client.synch().expect("Failed to synch");
    drop(client);

    // Records are flushed after serve returns, so the count reads 0
    assert_eq!(handle.join().expect("Session panicked"), 0);
    assert_eq!(accounting.count(Database::Wtmp, EntryKind::Login), 2);
    assert_eq!(accounting.count(Database::Wtmp, EntryKind::Logout), 2);
    assert_eq!(accounting.count(Database::Utmp, EntryKind::Logout), 2);
}

#[test]
fn test_wakeup_stops_idle_session_and_flushes() {
    let (client_control, helper_control) = channel();
    let (client_fdpass, helper_fdpass) = channel();
    let (wake_read, wake_write) = pipe().expect("Failed to create pipe");
    let stop = Arc::new(AtomicBool::new(false));
    let accounting = RecordingAccounting::new();

    let recorder = accounting.clone();
    let session_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let identity = Identity::resolve_with(None, None);
        let mut session = HelperSession::new(
            helper_control,
            helper_fdpass,
            identity,
            recorder,
            PrivilegedAllocator::new("tty"),
        );
        let result = session.serve(&session_stop, Some(wake_read.as_fd()));
        (result.is_ok(), session.open_records())
    });

    let mut client = HelperClient::from_fds(client_control, client_fdpass);
    client.open(Databases::ALL).expect("Failed to open PTY");
    client.synch().expect("Failed to synch");

    // The session is now blocked with nothing to read, as a signal handler would find it
    stop.store(true, Ordering::SeqCst);
    write(&wake_write, b"x").expect("Failed to wake session");

    let deadline = Instant::now() + Duration::from_secs(2);
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(handle.is_finished(), "session ignored the wakeup");
    assert_eq!(handle.join().expect("Session panicked"), (true, 0));
    assert_eq!(accounting.count(Database::Wtmp, EntryKind::Logout), 1);
    drop(client);
}

#[test]
fn test_allocation_failure_reports_open_failed() {
    let (mut client, accounting, handle) = start_session(ExhaustedAllocator);

    assert!(matches!(client.open(Databases::ALL), Err(HelperError::OpenFailed)));
    client.synch().expect("Session should keep serving");
    assert!(accounting.entries().is_empty());

    drop(client);
    assert_eq!(handle.join().expect("Session panicked"), 0);
}

#[test]
fn test_unknown_opcode_is_ignored() {
    let (client_control, helper_control) = channel();
    let (_client_fdpass, helper_fdpass) = channel();

    let handle = thread::spawn(move || {
        let identity = Identity::resolve_with(None, None);
        let mut session = HelperSession::new(
            helper_control,
            helper_fdpass,
            identity,
            RecordingAccounting::new(),
            ExhaustedAllocator,
        );
        session.serve(&AtomicBool::new(false), None).is_ok()
    });

    write_int(client_control.as_fd(), 99).expect("Failed to write opcode");
    write_int(client_control.as_fd(), Opcode::Synch as i32).expect("Failed to write synch");
    let mut ack = [0xffu8; 1];
    read_exact(client_control.as_fd(), &mut ack).expect("No synch reply");
    assert_eq!(ack, [0]);

    drop(client_control);
    assert!(handle.join().expect("Session panicked"));
}
