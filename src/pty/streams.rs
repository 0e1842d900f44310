//! STREAMS-based PTY driver (illumos, Solaris)
//!
//! The peer comes up as a bare stream. The pseudo-terminal emulation,
//! line discipline and BSD compatibility modules have to be pushed before
//! it behaves like a terminal.

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use super::platform::PtyPlatform;
use super::PtyFlags;

const STR: libc::c_int = (b'S' as libc::c_int) << 8;
const I_PUSH: libc::c_int = STR | 0o2;
const I_FIND: libc::c_int = STR | 0o13;
const TIOCPKT: libc::c_int = ((b't' as libc::c_int) << 8) | 112;

const MODULES: [&[u8]; 3] = [b"ptem\0", b"ldterm\0", b"ttcompat\0"];

extern "C" {
    fn isastream(fd: libc::c_int) -> libc::c_int;
}

/// The STREAMS terminal driver
pub struct Streams;

impl PtyPlatform for Streams {
    fn acquire_controlling_tty(_peer: RawFd, _flags: PtyFlags) -> Result<(), Errno> {
        // Opening the peer without O_NOCTTY as session leader already did it.
        Ok(())
    }

    fn push_line_discipline(peer: RawFd) -> Result<(), Errno> {
        // SAFETY: isastream only inspects the descriptor
        if unsafe { isastream(peer) } != 1 {
            return Ok(());
        }
        for module in MODULES {
            // SAFETY: module is a NUL-terminated static string
            let found = unsafe { libc::ioctl(peer, I_FIND as _, module.as_ptr()) };
            if found == 0 {
                let rv = unsafe { libc::ioctl(peer, I_PUSH as _, module.as_ptr()) };
                Errno::result(rv)?;
            }
        }
        Ok(())
    }

    fn set_packet_mode(fd: RawFd, enabled: bool) -> Result<(), Errno> {
        let mode: libc::c_int = enabled.into();
        // SAFETY: TIOCPKT reads one int through the pointer
        let rv = unsafe { libc::ioctl(fd, TIOCPKT as _, &mode) };
        Errno::result(rv).map(drop)
    }
}
