//! PTY (Pseudoterminal) handling
//!
//! This module allocates and manages PTY masters. A [`Pty`] owns exactly
//! one master descriptor, which is always non-blocking, close-on-exec and in
//! packet mode, plus the flags it was created with. Handles are shared
//! through [`PtyHandle`] because a spawn operation and the terminal that
//! reads the master may hold it at the same time.
//!
//! There is no internal locking: callers serialize reads and writes.

mod platform;
mod size;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
mod streams;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "illumos",
    target_os = "solaris"
)))]
mod bsd;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};

use crate::child::{self, CHILD_EXIT_STATUS};
use crate::error::{PtyError, PtyResult};

pub(crate) use platform::{peer_name, set_cloexec, set_nonblocking};
pub use platform::{NativePlatform, PtyPlatform};
pub use size::{WindowSize, DEFAULT_COLS, DEFAULT_ROWS};

/// Shared ownership of a PTY; the master closes when the last clone drops
pub type PtyHandle = Arc<Pty>;

/// First byte of a packet-mode read that carries terminal data
const PACKET_DATA: u8 = 0;

/// Flags fixed when a PTY is created
///
/// `no_session` without `no_ctty` makes child setup fail, since only a
/// session leader can acquire a controlling terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtyFlags {
    /// Do not start a new session in the child
    pub no_session: bool,
    /// Do not make the peer the child's controlling terminal
    pub no_ctty: bool,
    /// Skip the lastlog entry when allocating through the helper
    pub no_lastlog: bool,
    /// Skip the utmp entry when allocating through the helper
    pub no_utmp: bool,
    /// Skip the wtmp entry when allocating through the helper
    pub no_wtmp: bool,
}

impl PtyFlags {
    /// Flags that skip every login accounting database
    pub fn no_accounting() -> Self {
        PtyFlags {
            no_lastlog: true,
            no_utmp: true,
            no_wtmp: true,
            ..Default::default()
        }
    }
}

/// The outcome of one packet-mode read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// This many bytes of terminal output now start the buffer
    Data(usize),
    /// A `TIOCPKT_*` status byte with no data attached
    Control(u8),
    /// Nothing to read right now
    WouldBlock,
}

/// A pseudoterminal master
#[derive(Debug)]
pub struct Pty {
    master: OwnedFd,
    flags: PtyFlags,
}

impl Pty {
    /// Allocate a new PTY master
    pub fn create(flags: PtyFlags) -> PtyResult<Self> {
        let master = NativePlatform::open_master()?;
        NativePlatform::set_packet_mode(master.as_raw_fd(), true).map_err(PtyError::PacketMode)?;

        tracing::debug!(fd = master.as_raw_fd(), ?flags, "Allocated PTY master");
        Ok(Pty { master, flags })
    }

    /// Adopt an already-open master descriptor
    ///
    /// Applies the same grant/unlock, close-on-exec, non-blocking and packet
    /// mode setup as [`Pty::create`].
    pub fn create_foreign(fd: OwnedFd, flags: PtyFlags) -> PtyResult<Self> {
        let raw = fd.as_raw_fd();
        fcntl(raw, FcntlArg::F_GETFD).map_err(PtyError::InvalidDescriptor)?;

        // SAFETY: grantpt and unlockpt only operate on the descriptor
        Errno::result(unsafe { libc::grantpt(raw) }).map_err(PtyError::GrantPty)?;
        Errno::result(unsafe { libc::unlockpt(raw) }).map_err(PtyError::UnlockPty)?;

        set_cloexec(raw).map_err(PtyError::SetCloexec)?;
        set_nonblocking(raw).map_err(PtyError::SetNonBlocking)?;
        NativePlatform::set_packet_mode(raw, true).map_err(PtyError::PacketMode)?;

        tracing::debug!(fd = raw, ?flags, "Adopted foreign PTY master");
        Ok(Pty { master: fd, flags })
    }

    /// Adopt a raw master descriptor
    ///
    /// # Safety
    /// `fd` must be either negative or an open descriptor that nothing else
    /// owns.
    pub unsafe fn from_raw_fd(fd: RawFd, flags: PtyFlags) -> PtyResult<Self> {
        if fd < 0 {
            return Err(PtyError::InvalidDescriptor(Errno::EBADF));
        }
        Self::create_foreign(OwnedFd::from_raw_fd(fd), flags)
    }

    /// Get the raw file descriptor of the PTY master
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Flags this PTY was created with
    pub fn flags(&self) -> PtyFlags {
        self.flags
    }

    /// Query the kernel's window size
    pub fn get_size(&self) -> PtyResult<WindowSize> {
        WindowSize::get_from_fd(self.master.as_raw_fd()).map_err(PtyError::GetWindowSize)
    }

    /// Update the kernel's window size; zero rows or columns mean 24x80
    ///
    /// The kernel sends `SIGWINCH` to the foreground process group.
    pub fn set_size(&self, size: WindowSize) -> PtyResult<()> {
        size.or_default_cells()
            .set_on_fd(self.master.as_raw_fd())
            .map_err(PtyError::SetWindowSize)
    }

    /// Toggle `IUTF8` in the line discipline
    ///
    /// Kernels without the flag treat this as a no-op.
    pub fn set_utf8(&self, utf8: bool) -> PtyResult<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use nix::sys::termios::{tcgetattr, tcsetattr, InputFlags, SetArg};

            let mut termios = tcgetattr(&self.master).map_err(PtyError::Termios)?;
            let before = termios.input_flags;
            termios.input_flags.set(InputFlags::IUTF8, utf8);
            if termios.input_flags != before {
                tcsetattr(&self.master, SetArg::TCSANOW, &termios).map_err(PtyError::Termios)?;
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = utf8;

        Ok(())
    }

    /// Device path of the peer side
    pub fn peer_name(&self) -> PtyResult<String> {
        platform::peer_name(self.master.as_raw_fd()).map_err(PtyError::PtsName)
    }

    /// Open the peer in the calling process
    ///
    /// The peer never becomes the caller's controlling terminal.
    pub fn open_peer(&self) -> PtyResult<OwnedFd> {
        let flags = PtyFlags {
            no_ctty: true,
            ..self.flags
        };
        let fd = NativePlatform::open_peer(self.master.as_raw_fd(), flags).map_err(PtyError::OpenPeer)?;
        // SAFETY: open_peer returned a fresh descriptor we now own
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Turn the calling process into a child attached to this PTY
    ///
    /// Resets signals, starts a session, attaches the peer as controlling
    /// terminal and puts it on stdin, stdout and stderr. Exits with status
    /// 127 if any step fails.
    ///
    /// # Safety
    /// Only call this in a child right after `fork()`. It must be the
    /// single thread in its process; nothing here allocates.
    pub unsafe fn child_setup(&self) {
        let result = child::reset_signals()
            .and_then(|()| child::start_session(self.flags))
            .and_then(|()| child::open_terminal(self.master.as_raw_fd(), self.flags))
            .and_then(child::dup_stdio);
        if result.is_err() {
            libc::_exit(CHILD_EXIT_STATUS);
        }
    }

    /// Read one packet from the master (non-blocking)
    ///
    /// Data packets are shifted so the output starts at `buf[0]`.
    pub fn read_packet(&self, buf: &mut [u8]) -> PtyResult<Packet> {
        let n = match read(self.master.as_raw_fd(), buf) {
            Ok(n) => n,
            Err(Errno::EAGAIN) => return Ok(Packet::WouldBlock),
            Err(e) => return Err(PtyError::Read(e)),
        };
        if n == 0 {
            return Ok(Packet::Data(0));
        }
        if buf[0] == PACKET_DATA {
            buf.copy_within(1..n, 0);
            Ok(Packet::Data(n - 1))
        } else {
            Ok(Packet::Control(buf[0]))
        }
    }

    /// Write to the PTY master
    ///
    /// Returns the number of bytes written, or 0 if the master is full.
    pub fn write(&self, data: &[u8]) -> PtyResult<usize> {
        match write(&self.master, data) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(PtyError::Write(e)),
        }
    }

    /// Write all data to the PTY master, waiting for room as needed
    pub fn write_all(&self, mut data: &[u8]) -> PtyResult<()> {
        while !data.is_empty() {
            let n = self.write(data)?;
            if n == 0 {
                self.poll(PollFlags::POLLOUT, PollTimeout::NONE)?;
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Poll for data available to read
    ///
    /// Returns true if data is available, false if the timeout expired.
    pub fn poll_read(&self, timeout_ms: u16) -> PtyResult<bool> {
        self.poll(PollFlags::POLLIN, PollTimeout::from(timeout_ms))
    }

    fn poll(&self, events: PollFlags, timeout: PollTimeout) -> PtyResult<bool> {
        let mut fds = [PollFd::new(self.master.as_fd(), events)];
        let n = match poll(&mut fds, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(false),
            Err(e) => return Err(PtyError::Poll(e)),
        };
        Ok(n > 0 && fds[0].revents().is_some_and(|r| r.intersects(events)))
    }
}

impl AsFd for Pty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{FdFlag, OFlag};

    fn assert_master_invariants(pty: &Pty) {
        let fd = pty.master_fd();
        let fd_flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
        assert!(fd_flags.contains(FdFlag::FD_CLOEXEC), "master is not close-on-exec");
        let fl_flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        assert!(fl_flags.contains(OFlag::O_NONBLOCK), "master is blocking");
        assert_packet_mode(pty);
    }

    /// Data written to the peer must come back behind a TIOCPKT_DATA byte
    fn assert_packet_mode(pty: &Pty) {
        let peer = pty.open_peer().expect("Failed to open peer");
        write(&peer, b"xy").expect("Failed to write to peer");

        let mut buf = [0u8; 16];
        for _ in 0..20 {
            if !pty.poll_read(100).expect("Failed to poll") {
                continue;
            }
            let n = match read(pty.master_fd(), &mut buf) {
                Ok(n) => n,
                Err(Errno::EAGAIN) => continue,
                Err(e) => panic!("Failed to read master: {}", e),
            };
            // A lone non-zero byte is a status packet
            if n == 1 && buf[0] != PACKET_DATA {
                continue;
            }
            assert_eq!(&buf[..n], &[PACKET_DATA, b'x', b'y'], "master is not in packet mode");
            return;
        }
        panic!("peer output never reached the master");
    }

    #[test]
    fn test_create_sets_descriptor_flags() {
        for no_session in [false, true] {
            for no_ctty in [false, true] {
                let flags = PtyFlags {
                    no_session,
                    no_ctty,
                    ..Default::default()
                };
                let pty = Pty::create(flags).expect("Failed to create PTY");
                assert_master_invariants(&pty);
                assert_eq!(pty.flags(), flags);
            }
        }
    }

    #[test]
    fn test_packet_mode_prefixes_data() {
        let pty = Pty::create(PtyFlags::default()).expect("Failed to create PTY");
        let peer = pty.open_peer().expect("Failed to open peer");
        write(&peer, b"hi").expect("Failed to write to peer");

        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        for _ in 0..50 {
            if pty.poll_read(100).expect("Failed to poll") {
                match pty.read_packet(&mut buf).expect("Failed to read") {
                    Packet::Data(n) => got.extend_from_slice(&buf[..n]),
                    Packet::Control(_) | Packet::WouldBlock => {},
                }
            }
            if got.len() >= 2 {
                break;
            }
        }
        assert_eq!(&got, b"hi");
    }

    #[test]
    fn test_set_and_get_size() {
        let pty = Pty::create(PtyFlags::default()).expect("Failed to create PTY");
        pty.set_size(WindowSize::new(40, 120)).expect("Failed to set size");
        let size = pty.get_size().expect("Failed to get size");
        assert_eq!(size.rows, 40);
        assert_eq!(size.cols, 120);

        pty.set_size(WindowSize::new(0, 0)).expect("Failed to set size");
        let size = pty.get_size().expect("Failed to get size");
        assert_eq!((size.rows, size.cols), (24, 80));
    }

    #[test]
    fn test_set_utf8_is_idempotent() {
        let pty = Pty::create(PtyFlags::default()).expect("Failed to create PTY");
        pty.set_utf8(true).expect("Failed to enable UTF-8");
        pty.set_utf8(true).expect("Failed to enable UTF-8 twice");
        pty.set_utf8(false).expect("Failed to disable UTF-8");
    }

    #[test]
    fn test_create_foreign_adopts_master() {
        let original = Pty::create(PtyFlags::default()).expect("Failed to create PTY");
        let dup = original.master.try_clone().expect("Failed to dup master");
        let adopted = Pty::create_foreign(dup, PtyFlags::no_accounting()).expect("Failed to adopt master");
        assert_master_invariants(&adopted);
        assert_eq!(adopted.peer_name().unwrap(), original.peer_name().unwrap());
    }

    #[test]
    fn test_create_foreign_rejects_invalid_descriptor() {
        let err = unsafe { Pty::from_raw_fd(-1, PtyFlags::default()) }.unwrap_err();
        assert_eq!(err.errno(), Errno::EBADF);
    }

    #[test]
    fn test_create_foreign_rejects_non_pty() {
        let file = tempfile::tempfile().expect("Failed to create temp file");
        assert!(Pty::create_foreign(OwnedFd::from(file), PtyFlags::default()).is_err());
    }

    #[test]
    fn test_peer_name_is_device_path() {
        let pty = Pty::create(PtyFlags::default()).expect("Failed to create PTY");
        let name = pty.peer_name().expect("Failed to get peer name");
        assert!(name.starts_with("/dev/"), "unexpected peer name {}", name);
    }
}
