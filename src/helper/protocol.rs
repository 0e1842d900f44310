//! Wire format of the helper control channel
//!
//! Every request starts with a native-endian `int` opcode. Open replies are
//! an `int` status followed, on success, by a pointer-sized token. The
//! descriptors travel separately over the fd-passing channel.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::unistd::{read, write};

use crate::error::HelperError;
use crate::pty::PtyFlags;

/// Request codes understood by the helper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    OpenUtmp = 1,
    OpenUtmpWtmp = 2,
    OpenWtmp = 3,
    OpenLastlog = 4,
    OpenLastlogUtmp = 5,
    OpenLastlogUtmpWtmp = 6,
    OpenLastlogWtmp = 7,
    OpenNoDbUpdate = 8,
    ResetToDefaults = 9,
    Close = 10,
    Synch = 11,
}

impl Opcode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => Opcode::OpenUtmp,
            2 => Opcode::OpenUtmpWtmp,
            3 => Opcode::OpenWtmp,
            4 => Opcode::OpenLastlog,
            5 => Opcode::OpenLastlogUtmp,
            6 => Opcode::OpenLastlogUtmpWtmp,
            7 => Opcode::OpenLastlogWtmp,
            8 => Opcode::OpenNoDbUpdate,
            9 => Opcode::ResetToDefaults,
            10 => Opcode::Close,
            11 => Opcode::Synch,
            _ => return None,
        })
    }

    /// The databases an open request updates, or `None` for other requests
    pub fn databases(self) -> Option<Databases> {
        let (utmp, wtmp, lastlog) = match self {
            Opcode::OpenUtmp => (true, false, false),
            Opcode::OpenUtmpWtmp => (true, true, false),
            Opcode::OpenWtmp => (false, true, false),
            Opcode::OpenLastlog => (false, false, true),
            Opcode::OpenLastlogUtmp => (true, false, true),
            Opcode::OpenLastlogUtmpWtmp => (true, true, true),
            Opcode::OpenLastlogWtmp => (false, true, true),
            Opcode::OpenNoDbUpdate => (false, false, false),
            _ => return None,
        };
        Some(Databases { utmp, wtmp, lastlog })
    }

    /// The open request that updates exactly `databases`
    pub fn open_for(databases: Databases) -> Self {
        match (databases.utmp, databases.wtmp, databases.lastlog) {
            (true, false, false) => Opcode::OpenUtmp,
            (true, true, false) => Opcode::OpenUtmpWtmp,
            (false, true, false) => Opcode::OpenWtmp,
            (false, false, true) => Opcode::OpenLastlog,
            (true, false, true) => Opcode::OpenLastlogUtmp,
            (true, true, true) => Opcode::OpenLastlogUtmpWtmp,
            (false, true, true) => Opcode::OpenLastlogWtmp,
            (false, false, false) => Opcode::OpenNoDbUpdate,
        }
    }
}

/// One of the login accounting databases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Database {
    Utmp,
    Wtmp,
    Lastlog,
}

/// Which accounting databases a PTY is recorded in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Databases {
    pub utmp: bool,
    pub wtmp: bool,
    pub lastlog: bool,
}

impl Databases {
    pub const NONE: Databases = Databases {
        utmp: false,
        wtmp: false,
        lastlog: false,
    };

    pub const ALL: Databases = Databases {
        utmp: true,
        wtmp: true,
        lastlog: true,
    };

    /// Databases to update for a PTY created with `flags`
    pub fn from_flags(flags: PtyFlags) -> Self {
        Databases {
            utmp: !flags.no_utmp,
            wtmp: !flags.no_wtmp,
            lastlog: !flags.no_lastlog,
        }
    }

    pub fn any(self) -> bool {
        self.utmp || self.wtmp || self.lastlog
    }

    pub fn iter(self) -> impl Iterator<Item = Database> {
        [
            (self.utmp, Database::Utmp),
            (self.wtmp, Database::Wtmp),
            (self.lastlog, Database::Lastlog),
        ]
        .into_iter()
        .filter_map(|(enabled, db)| enabled.then_some(db))
    }
}

/// Opaque handle naming one open PTY record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    pub const SIZE: usize = std::mem::size_of::<usize>();
}

/// Read exactly `buf.len()` bytes
///
/// End of file or a short read is a disconnect. An `EINTR` before any
/// byte arrived is returned as `Io(EINTR)` so the caller can look at its
/// shutdown flag.
pub fn read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<(), HelperError> {
    let mut filled = 0;
    while filled < buf.len() {
        match read(fd.as_raw_fd(), &mut buf[filled..]) {
            Ok(0) => return Err(HelperError::Disconnected),
            Ok(n) => filled += n,
            Err(Errno::EINTR) if filled > 0 => {},
            Err(e) => return Err(HelperError::Io(e)),
        }
    }
    Ok(())
}

pub fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> Result<(), HelperError> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(0) => return Err(HelperError::Disconnected),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => {},
            Err(Errno::EPIPE) => return Err(HelperError::Disconnected),
            Err(e) => return Err(HelperError::Io(e)),
        }
    }
    Ok(())
}

pub fn read_int(fd: BorrowedFd<'_>) -> Result<i32, HelperError> {
    let mut buf = [0u8; 4];
    read_exact(fd, &mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

pub fn write_int(fd: BorrowedFd<'_>, value: i32) -> Result<(), HelperError> {
    write_all(fd, &value.to_ne_bytes())
}

pub fn read_token(fd: BorrowedFd<'_>) -> Result<Token, HelperError> {
    let mut buf = [0u8; Token::SIZE];
    read_exact(fd, &mut buf)?;
    Ok(Token(usize::from_ne_bytes(buf)))
}

pub fn write_token(fd: BorrowedFd<'_>, token: Token) -> Result<(), HelperError> {
    write_all(fd, &token.0.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::AsFd;

    #[test]
    fn test_open_opcodes_match_databases() {
        for raw in 1..=8 {
            let op = Opcode::from_raw(raw).unwrap();
            let dbs = op.databases().unwrap();
            assert_eq!(Opcode::open_for(dbs), op);
        }
        assert_eq!(Opcode::OpenNoDbUpdate.databases(), Some(Databases::NONE));
        assert_eq!(Opcode::Close.databases(), None);
        assert_eq!(Opcode::from_raw(0), None);
        assert_eq!(Opcode::from_raw(12), None);
    }

    #[test]
    fn test_flags_select_databases() {
        let flags = PtyFlags {
            no_utmp: true,
            ..PtyFlags::default()
        };
        let dbs = Databases::from_flags(flags);
        assert_eq!(Opcode::open_for(dbs), Opcode::OpenLastlogWtmp);
        assert_eq!(
            Opcode::open_for(Databases::from_flags(PtyFlags::no_accounting())),
            Opcode::OpenNoDbUpdate
        );
        assert_eq!(dbs.iter().collect::<Vec<_>>(), vec![Database::Wtmp, Database::Lastlog]);
    }

    #[test]
    fn test_token_over_socket() {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).unwrap();
        write_token(a.as_fd(), Token(0xdead_beef)).unwrap();
        write_int(a.as_fd(), -3).unwrap();
        assert_eq!(read_token(b.as_fd()).unwrap(), Token(0xdead_beef));
        assert_eq!(read_int(b.as_fd()).unwrap(), -3);
    }

    #[test]
    fn test_short_read_is_disconnect() {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).unwrap();
        write_all(a.as_fd(), &[1, 2]).unwrap();
        drop(a);
        assert!(matches!(read_token(b.as_fd()), Err(HelperError::Disconnected)));
    }
}
