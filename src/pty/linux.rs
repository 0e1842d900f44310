//! Linux PTY driver
//!
//! Linux can hand out the peer straight from the master with `TIOCGPTPEER`,
//! which avoids a path lookup through devpts. Kernels older than 4.13 report
//! `EINVAL` or `ENOTTY` for it, in which case the peer is opened by name.
//!
//! # References
//!
//! - ioctl_tty(2): https://man7.org/linux/man-pages/man2/ioctl_tty.2.html
//! - pty(7): https://man7.org/linux/man-pages/man7/pty.7.html

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use super::platform::{open_peer_by_name, PtyPlatform};
use super::PtyFlags;

/// `_IO('T', 0x41)`, whose encoding differs on a few architectures
#[cfg(any(
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "sparc64"
))]
const TIOCGPTPEER: libc::c_ulong = 0x2000_5441;
#[cfg(not(any(
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "sparc64"
)))]
const TIOCGPTPEER: libc::c_ulong = 0x5441;

/// The Linux terminal driver
pub struct Linux;

impl PtyPlatform for Linux {
    fn open_peer(master: RawFd, flags: PtyFlags) -> Result<RawFd, Errno> {
        let mut oflags = libc::O_RDWR | libc::O_CLOEXEC;
        if flags.no_ctty {
            oflags |= libc::O_NOCTTY;
        }

        // SAFETY: TIOCGPTPEER takes open flags by value and returns a new fd
        let fd = unsafe { libc::ioctl(master, TIOCGPTPEER as _, oflags) };
        if fd >= 0 {
            return Ok(fd);
        }
        match Errno::last() {
            Errno::EINVAL | Errno::ENOTTY => open_peer_by_name(master, flags),
            e => Err(e),
        }
    }
}
