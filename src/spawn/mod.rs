//! Spawning programs on a PTY
//!
//! [`SpawnConfig`] describes the request, [`SpawnOperation`] carries it out:
//! fork, run the child setup, wait on the report pipe, optionally move the
//! child into a systemd scope.

mod cancel;
mod config;
mod environ;
mod operation;
mod pool;
mod scope;

use std::os::fd::OwnedFd;

use nix::errno::Errno;

pub use cancel::Cancellable;
pub use config::{validate_fd_targets, ChildSetupFn, FdMapping, SpawnConfig};
pub use environ::{
    merge_environment, prepare_environment, version_number, COLORTERM_VALUE, TERM_DEFAULT, VERSION_VAR,
};
pub use operation::{abandon_target, KillTarget, SpawnOperation, DEFAULT_TIMEOUT};
pub use pool::WaitPool;
pub use scope::{NoScope, ScopeError, ScopeManager, SystemdScope, FALLBACK_SLICE};

/// A pipe with both ends close-on-exec, as `(read, write)`
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos",
    target_os = "solaris"
))]
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

/// A pipe with both ends close-on-exec, as `(read, write)`
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos",
    target_os = "solaris"
)))]
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    use std::os::fd::AsRawFd;

    let (read, write) = nix::unistd::pipe()?;
    crate::pty::set_cloexec(read.as_raw_fd())?;
    crate::pty::set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}
