//! Process setup for the privileged helper
//!
//! The helper runs setuid and inherits whatever state its caller left.
//! Before serving anything it checks its channels, puts something on
//! stderr, drops stray descriptors and fixes signal dispositions.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{sigaction, signal, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::chdir;

use crate::child::max_open_fd;
use crate::pty::set_nonblocking;
use crate::spawn::cloexec_pipe;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
/// Write end of the wakeup pipe, or -1 before the handlers are installed
static WAKEUP: AtomicI32 = AtomicI32::new(-1);

extern "C" fn request_shutdown(_signo: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    let fd = WAKEUP.load(Ordering::SeqCst);
    if fd >= 0 {
        // SAFETY: write(2) is async-signal-safe; a full pipe already wakes the reader
        unsafe { libc::write(fd, b"x".as_ptr().cast(), 1) };
    }
}

/// Set once SIGHUP or SIGTERM arrived
pub fn shutdown_flag() -> &'static AtomicBool {
    &SHUTDOWN
}

fn is_open(fd: libc::c_int) -> bool {
    !matches!(fcntl(fd, FcntlArg::F_GETFL), Err(Errno::EBADF))
}

/// Point a closed stderr at the terminal, or at `/dev/null`
fn ensure_stderr() -> Result<(), Errno> {
    if is_open(libc::STDERR_FILENO) {
        return Ok(());
    }
    // SAFETY: NUL-terminated literals; the descriptor is ours
    unsafe {
        let mut fd = libc::open(b"/dev/tty\0".as_ptr().cast(), libc::O_RDWR);
        if fd == -1 {
            fd = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR);
        }
        if fd == -1 {
            return Err(Errno::last());
        }
        if fd != libc::STDERR_FILENO {
            while libc::dup2(fd, libc::STDERR_FILENO) == -1 {
                if Errno::last() != Errno::EINTR {
                    return Err(Errno::last());
                }
            }
            libc::close(fd);
        }
    }
    Ok(())
}

/// Close every descriptor from 3 upwards
fn close_stray_descriptors() {
    let max_fd = max_open_fd();
    for fd in 3..=max_fd {
        // SAFETY: nothing in this process uses these descriptors yet
        unsafe { libc::close(fd) };
    }
}

/// Ignore SIGINT and SIGIO, making sure neither is blocked
fn ignore_interrupts() -> Result<(), Errno> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGIO);
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)?;
    // SAFETY: SIG_IGN installs no handler code
    unsafe {
        signal(Signal::SIGINT, SigHandler::SigIgn)?;
        signal(Signal::SIGIO, SigHandler::SigIgn)?;
    }
    Ok(())
}

/// Check channels and clean up inherited state
///
/// Fails with `EBADF` if descriptor 0 or 1 is closed; those are the
/// client's channels.
pub fn sanitize_process() -> Result<(), Errno> {
    if !is_open(libc::STDIN_FILENO) || !is_open(libc::STDOUT_FILENO) {
        return Err(Errno::EBADF);
    }
    ensure_stderr()?;
    close_stray_descriptors();
    ignore_interrupts()?;
    if let Err(e) = chdir("/") {
        tracing::warn!("Failed to chdir to /: {}", e);
    }
    Ok(())
}

/// SIGHUP and SIGTERM set [`shutdown_flag`] and make the returned
/// descriptor readable
///
/// Poll the descriptor next to whatever the process blocks on. A signal that
/// lands between checking the flag and blocking still wakes the poll.
pub fn install_shutdown_handlers() -> Result<OwnedFd, Errno> {
    let (wakeup, notify) = cloexec_pipe()?;
    set_nonblocking(notify.as_raw_fd())?;
    // Lives as long as the process; the handler may fire at any point
    let previous = WAKEUP.swap(notify.into_raw_fd(), Ordering::SeqCst);
    if previous >= 0 {
        // SAFETY: the old write end was leaked by an earlier call and is unused
        unsafe { libc::close(previous) };
    }

    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics and calls write(2)
    unsafe {
        sigaction(Signal::SIGHUP, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(wakeup)
}
