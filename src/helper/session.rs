//! The helper's request loop
//!
//! A [`HelperSession`] owns the two channels to its single client, the
//! table of open PTY records, and the accounting backend. Nothing here is
//! shared between threads.

use std::collections::BTreeMap;
use std::env;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::Termios;
use nix::unistd::{getegid, geteuid, getgid, getppid, getuid, setegid, seteuid, Gid, Group, Uid, User};

use super::accounting::{Accounting, UtmpEntry};
use super::fdpass::send_fd;
use super::protocol::{read_int, read_token, write_all, write_int, write_token, Databases, Opcode, Token};
use crate::error::HelperError;
use crate::pty::peer_name;

/// Who the helper allocates terminals for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub login_name: String,
    pub uid: Uid,
    pub gid: Gid,
    /// Remote host recorded in utmp
    pub host: String,
}

impl Identity {
    /// Resolve the real user from `LOGNAME` and `DISPLAY`
    pub fn resolve() -> Self {
        let logname = env::var("LOGNAME").ok();
        let display = env::var("DISPLAY").ok();
        Self::resolve_with(logname.as_deref(), display.as_deref())
    }

    /// `LOGNAME` is trusted only if it names the real uid
    pub fn resolve_with(logname: Option<&str>, display: Option<&str>) -> Self {
        let uid = getuid();
        let user = logname
            .and_then(|name| User::from_name(name).ok().flatten())
            .filter(|user| user.uid == uid)
            .or_else(|| User::from_uid(uid).ok().flatten());

        let (login_name, gid) = match user {
            Some(user) => (user.name, user.gid),
            None => (format!("#{}", uid), getgid()),
        };
        let host = display
            .filter(|d| !d.is_empty())
            .unwrap_or("localhost")
            .to_string();

        Identity {
            login_name,
            uid,
            gid,
            host,
        }
    }
}

/// A freshly opened master/peer pair
#[derive(Debug)]
pub struct AllocatedPty {
    pub master: OwnedFd,
    pub peer: OwnedFd,
    /// Path of the peer device
    pub path: String,
}

/// Source of PTY pairs for the helper
pub trait PtyAllocator {
    fn allocate(&mut self, identity: &Identity) -> Result<AllocatedPty, HelperError>;
}

/// Allocates with the user's credentials, then hands the peer to the user
#[derive(Debug, Clone)]
pub struct PrivilegedAllocator {
    tty_group: String,
}

impl PrivilegedAllocator {
    pub fn new(tty_group: impl Into<String>) -> Self {
        PrivilegedAllocator {
            tty_group: tty_group.into(),
        }
    }
}

/// Line settings equivalent to `stty sane`
pub fn sane_termios() -> Termios {
    // SAFETY: termios is plain data
    let mut t: libc::termios = unsafe { std::mem::zeroed() };
    t.c_iflag = libc::BRKINT | libc::ICRNL | libc::IMAXBEL | libc::IXON | libc::IXANY;
    t.c_oflag = libc::OPOST | libc::ONLCR;
    t.c_cflag = libc::CREAD | libc::CS8 | libc::HUPCL;
    t.c_lflag = libc::ECHO
        | libc::ICANON
        | libc::ISIG
        | libc::IEXTEN
        | libc::ECHOE
        | libc::ECHOKE
        | libc::ECHOK
        | libc::ECHOCTL;

    let ctrl = |c: u8| c - b'@';
    t.c_cc[libc::VMIN] = 1;
    t.c_cc[libc::VTIME] = 0;
    t.c_cc[libc::VINTR] = ctrl(b'C');
    t.c_cc[libc::VQUIT] = ctrl(b'\\');
    t.c_cc[libc::VERASE] = 127;
    t.c_cc[libc::VKILL] = ctrl(b'U');
    t.c_cc[libc::VEOF] = ctrl(b'D');
    t.c_cc[libc::VSTART] = ctrl(b'Q');
    t.c_cc[libc::VSTOP] = ctrl(b'S');
    t.c_cc[libc::VSUSP] = ctrl(b'Z');
    t.c_cc[libc::VEOL] = 255;
    t.c_cc[libc::VREPRINT] = ctrl(b'R');
    t.c_cc[libc::VDISCARD] = ctrl(b'O');
    t.c_cc[libc::VWERASE] = ctrl(b'W');
    t.c_cc[libc::VLNEXT] = ctrl(b'V');
    t.c_cc[libc::VEOL2] = 255;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        t.c_cc[libc::VSWTC] = 255;
    }
    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly", target_os = "netbsd", target_os = "openbsd"))]
    {
        t.c_cc[libc::VSTATUS] = ctrl(b'T');
        t.c_cc[libc::VDSUSP] = ctrl(b'Y');
    }

    // SAFETY: t is a valid termios
    unsafe {
        libc::cfsetispeed(&mut t, libc::B38400);
        libc::cfsetospeed(&mut t, libc::B38400);
    }
    Termios::from(t)
}

/// Run `f` with effective ids switched to `uid`/`gid`
///
/// The group goes first on the way down and last on the way back up.
fn with_credentials<T>(uid: Uid, gid: Gid, f: impl FnOnce() -> T) -> Result<T, HelperError> {
    let saved_uid = geteuid();
    let saved_gid = getegid();

    if saved_gid != gid {
        setegid(gid).map_err(HelperError::Credentials)?;
    }
    if saved_uid != uid {
        if let Err(e) = seteuid(uid) {
            let _ = setegid(saved_gid);
            return Err(HelperError::Credentials(e));
        }
    }

    let result = f();

    if geteuid() != saved_uid {
        seteuid(saved_uid).map_err(HelperError::Credentials)?;
    }
    if getegid() != saved_gid {
        setegid(saved_gid).map_err(HelperError::Credentials)?;
    }
    Ok(result)
}

/// Owner read/write, group write, group `tty` when it exists
fn hand_to_user(peer: &OwnedFd, uid: Uid, group: Option<Gid>) -> Result<(), Errno> {
    let gid = group.map_or(libc::gid_t::MAX, Gid::as_raw);
    // SAFETY: plain syscalls on a descriptor we own
    unsafe {
        Errno::result(libc::fchown(peer.as_raw_fd(), uid.as_raw(), gid))?;
        Errno::result(libc::fchmod(peer.as_raw_fd(), libc::S_IRUSR | libc::S_IWUSR | libc::S_IWGRP))?;
    }
    Ok(())
}

impl PtyAllocator for PrivilegedAllocator {
    fn allocate(&mut self, identity: &Identity) -> Result<AllocatedPty, HelperError> {
        let termios = sane_termios();
        let opened = with_credentials(identity.uid, identity.gid, || {
            openpty(None::<&Winsize>, Some(&termios))
        })?
        .map_err(HelperError::Allocate)?;

        let path = peer_name(opened.master.as_raw_fd()).map_err(HelperError::Allocate)?;

        let group = Group::from_name(&self.tty_group).ok().flatten().map(|g| g.gid);
        if let Err(e) = hand_to_user(&opened.slave, identity.uid, group) {
            tracing::warn!("Failed to set owner of {}: {}", path, e);
        }

        Ok(AllocatedPty {
            master: opened.master,
            peer: opened.slave,
            path,
        })
    }
}

/// An open PTY and the databases its login was written to
#[derive(Debug, Clone)]
pub struct PtyRecord {
    pub databases: Databases,
    pub login: UtmpEntry,
}

/// What the loop should do after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Shutdown,
}

enum Wait {
    Request,
    Interrupted,
    Woken,
}

/// One client connection: control channel, fd channel, open records
pub struct HelperSession<A, P> {
    control: OwnedFd,
    fdpass: OwnedFd,
    identity: Identity,
    accounting: A,
    allocator: P,
    records: BTreeMap<Token, PtyRecord>,
    next_token: usize,
    login_pid: i32,
}

impl<A: Accounting, P: PtyAllocator> HelperSession<A, P> {
    pub fn new(control: OwnedFd, fdpass: OwnedFd, identity: Identity, accounting: A, allocator: P) -> Self {
        HelperSession {
            control,
            fdpass,
            identity,
            accounting,
            allocator,
            records: BTreeMap::new(),
            next_token: 1,
            // Entries name the client, not the helper
            login_pid: getppid().as_raw(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn accounting(&self) -> &A {
        &self.accounting
    }

    /// Number of PTYs opened and not yet closed
    pub fn open_records(&self) -> usize {
        self.records.len()
    }

    /// Read and handle one request
    pub fn step(&mut self) -> Result<Step, HelperError> {
        let raw = match read_int(self.control.as_fd()) {
            Ok(raw) => raw,
            Err(HelperError::Io(Errno::EINTR)) => return Ok(Step::Continue),
            Err(HelperError::Disconnected) => return Ok(Step::Shutdown),
            Err(e) => return Err(e),
        };

        let Some(op) = Opcode::from_raw(raw) else {
            tracing::debug!("Ignoring unknown helper opcode {}", raw);
            return Ok(Step::Continue);
        };
        tracing::debug!(?op, "Helper request");

        if let Some(databases) = op.databases() {
            self.open(databases)?;
            return Ok(Step::Continue);
        }

        match op {
            Opcode::Close => match read_token(self.control.as_fd()) {
                Ok(token) => self.close(token),
                Err(_) => return Ok(Step::Shutdown),
            },
            Opcode::Synch => write_all(self.control.as_fd(), &[0])?,
            _ => {},
        }
        Ok(Step::Continue)
    }

    /// Serve requests until the client goes away or `shutdown` is set,
    /// then flush every open record
    ///
    /// Between requests the session waits on the control channel and on
    /// `wakeup`; whoever sets `shutdown` should also make `wakeup` readable.
    pub fn serve(&mut self, shutdown: &AtomicBool, wakeup: Option<BorrowedFd<'_>>) -> Result<(), HelperError> {
        let result = loop {
            if shutdown.load(Ordering::SeqCst) {
                tracing::debug!("Helper asked to shut down");
                break Ok(());
            }
            match self.wait_for_request(wakeup) {
                Ok(Wait::Request) => {},
                Ok(Wait::Interrupted) => continue,
                Ok(Wait::Woken) => {
                    tracing::debug!("Helper woken for shutdown");
                    break Ok(());
                },
                Err(e) => break Err(e),
            }
            match self.step() {
                Ok(Step::Continue) => {},
                Ok(Step::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        result
    }

    fn wait_for_request(&self, wakeup: Option<BorrowedFd<'_>>) -> Result<Wait, HelperError> {
        let mut fds = vec![PollFd::new(self.control.as_fd(), PollFlags::POLLIN)];
        if let Some(fd) = wakeup {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {},
            Err(Errno::EINTR) => return Ok(Wait::Interrupted),
            Err(e) => return Err(HelperError::Io(e)),
        }
        if fds.get(1).and_then(|fd| fd.revents()).is_some_and(|r| !r.is_empty()) {
            return Ok(Wait::Woken);
        }
        Ok(Wait::Request)
    }

    /// Write logout entries for every record still open
    pub fn shutdown(&mut self) {
        for (token, record) in std::mem::take(&mut self.records) {
            self.write_logout(token, &record);
        }
    }

    fn open(&mut self, databases: Databases) -> Result<(), HelperError> {
        let allocated = match self.allocator.allocate(&self.identity) {
            Ok(allocated) => allocated,
            Err(e) => {
                tracing::warn!("Failed to allocate PTY: {}", e);
                return write_int(self.control.as_fd(), 0);
            },
        };

        let token = Token(self.next_token);
        self.next_token += 1;

        let login = UtmpEntry::login(
            &self.identity.login_name,
            self.identity.uid.as_raw(),
            &self.identity.host,
            &allocated.path,
            self.login_pid,
        );
        for database in databases.iter() {
            if let Err(e) = self.accounting.write_entry(database, &login) {
                tracing::warn!("Failed to write {:?} login for {}: {}", database, login.line, e);
            }
        }
        self.records.insert(token, PtyRecord { databases, login });

        write_int(self.control.as_fd(), 1)?;
        write_token(self.control.as_fd(), token)?;
        send_fd(self.fdpass.as_fd(), allocated.master.as_fd())?;
        send_fd(self.fdpass.as_fd(), allocated.peer.as_fd())?;

        tracing::debug!(token = token.0, path = %allocated.path, "Opened PTY");
        Ok(())
    }

    fn close(&mut self, token: Token) {
        match self.records.remove(&token) {
            Some(record) => self.write_logout(token, &record),
            None => tracing::debug!(token = token.0, "Close for unknown token"),
        }
    }

    fn write_logout(&mut self, token: Token, record: &PtyRecord) {
        let logout = record.login.logout();
        for database in record.databases.iter() {
            if let Err(e) = self.accounting.write_entry(database, &logout) {
                tracing::warn!("Failed to write {:?} logout for {}: {}", database, logout.line, e);
            }
        }
        tracing::debug!(token = token.0, line = %logout.line, "Closed PTY");
    }
}
