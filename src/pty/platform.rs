//! Terminal driver operations that differ between kernels
//!
//! Everything platform-specific sits behind [`PtyPlatform`]. The rest of the
//! crate calls [`NativePlatform`] and never branches on the target OS.
//!
//! Methods taking a raw `master` or `peer` descriptor may run in a freshly
//! forked child, so they are limited to async-signal-safe calls and do not
//! allocate.

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt};

use super::PtyFlags;
use crate::error::PtyError;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub type NativePlatform = super::linux::Linux;

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub type NativePlatform = super::streams::Streams;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "illumos",
    target_os = "solaris"
)))]
pub type NativePlatform = super::bsd::Bsd;

/// Size of the stack buffer used to resolve the peer's device name
const PTS_NAME_MAX: usize = 128;

/// Kernel-specific PTY primitives
pub trait PtyPlatform {
    /// Allocate a master that is granted, unlocked, non-blocking and close-on-exec
    fn open_master() -> Result<OwnedFd, PtyError> {
        open_master_posix()
    }

    /// Open the peer side of `master` with close-on-exec set
    ///
    /// Honors `flags.no_ctty` by suppressing controlling-tty acquisition on
    /// open.
    fn open_peer(master: RawFd, flags: PtyFlags) -> Result<RawFd, Errno> {
        open_peer_by_name(master, flags)
    }

    /// Make `peer` the controlling terminal of the calling session
    fn acquire_controlling_tty(peer: RawFd, flags: PtyFlags) -> Result<(), Errno> {
        if flags.no_ctty {
            return Ok(());
        }
        // SAFETY: TIOCSCTTY takes an integer argument and touches no memory
        let rv = unsafe { libc::ioctl(peer, libc::TIOCSCTTY as _, 0) };
        Errno::result(rv).map(drop)
    }

    /// Push line discipline modules onto `peer` where the kernel needs them
    fn push_line_discipline(_peer: RawFd) -> Result<(), Errno> {
        Ok(())
    }

    /// Switch packet mode on or off
    fn set_packet_mode(fd: RawFd, enabled: bool) -> Result<(), Errno> {
        let mode: libc::c_int = enabled.into();
        // SAFETY: TIOCPKT reads one int through the pointer
        let rv = unsafe { libc::ioctl(fd, libc::TIOCPKT as _, &mode) };
        Errno::result(rv).map(drop)
    }
}

/// Open a master with `posix_openpt`
///
/// Asks for `O_NONBLOCK | O_CLOEXEC` up front. Kernels that reject those
/// flags with `EINVAL` get a plain open, and both paths then go through the
/// same flag retrofit, so the result is identical either way.
pub(crate) fn open_master_posix() -> Result<OwnedFd, PtyError> {
    let base = OFlag::O_RDWR | OFlag::O_NOCTTY;
    let master = match posix_openpt(base | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC) {
        Ok(master) => master,
        Err(Errno::EINVAL) => {
            tracing::debug!("posix_openpt rejected O_NONBLOCK|O_CLOEXEC, retrofitting flags");
            posix_openpt(base).map_err(PtyError::OpenMaster)?
        },
        Err(e) => return Err(PtyError::OpenMaster(e)),
    };

    grantpt(&master).map_err(PtyError::GrantPty)?;
    unlockpt(&master).map_err(PtyError::UnlockPty)?;

    // SAFETY: into_raw_fd hands over sole ownership of the descriptor
    let fd = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    set_cloexec(fd.as_raw_fd()).map_err(PtyError::SetCloexec)?;
    set_nonblocking(fd.as_raw_fd()).map_err(PtyError::SetNonBlocking)?;
    Ok(fd)
}

/// Set `FD_CLOEXEC`, leaving other descriptor flags alone
pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), Errno> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    if !flags.contains(FdFlag::FD_CLOEXEC) {
        fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    }
    Ok(())
}

/// Set `O_NONBLOCK`, leaving other status flags alone
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(())
}

/// Resolve the peer's device path into `buf` as a NUL-terminated string
#[cfg(any(target_os = "linux", target_os = "android"))]
fn ptsname_into(master: RawFd, buf: &mut [u8; PTS_NAME_MAX]) -> Result<(), Errno> {
    // SAFETY: buf is writable for its full length
    let rv = unsafe { libc::ptsname_r(master, buf.as_mut_ptr().cast(), buf.len()) };
    if rv != 0 {
        return Err(Errno::from_raw(rv));
    }
    Ok(())
}

/// Resolve the peer's device path into `buf` as a NUL-terminated string
///
/// `ptsname` returns a static buffer; this is only called from a
/// single-threaded child or with the name copied out immediately.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn ptsname_into(master: RawFd, buf: &mut [u8; PTS_NAME_MAX]) -> Result<(), Errno> {
    // SAFETY: ptsname returns NULL or a NUL-terminated static string
    let name = unsafe { libc::ptsname(master) };
    if name.is_null() {
        return Err(Errno::last());
    }
    let len = unsafe { libc::strlen(name) };
    if len + 1 > buf.len() {
        return Err(Errno::ERANGE);
    }
    // SAFETY: len + 1 bytes are readable from name and fit in buf
    unsafe { std::ptr::copy_nonoverlapping(name.cast::<u8>(), buf.as_mut_ptr(), len + 1) };
    Ok(())
}

/// Open the peer by resolving its path from the master
pub(crate) fn open_peer_by_name(master: RawFd, flags: PtyFlags) -> Result<RawFd, Errno> {
    let mut name = [0u8; PTS_NAME_MAX];
    ptsname_into(master, &mut name)?;

    let mut oflags = libc::O_RDWR | libc::O_CLOEXEC;
    if flags.no_ctty {
        oflags |= libc::O_NOCTTY;
    }
    loop {
        // SAFETY: name is NUL-terminated by ptsname_into
        let fd = unsafe { libc::open(name.as_ptr().cast(), oflags) };
        if fd >= 0 {
            return Ok(fd);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(e),
        }
    }
}

/// Resolve the peer path as an owned string, for use outside the child
pub(crate) fn peer_name(master: RawFd) -> Result<String, Errno> {
    let mut name = [0u8; PTS_NAME_MAX];
    ptsname_into(master, &mut name)?;
    let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    Ok(String::from_utf8_lossy(&name[..len]).into_owned())
}
