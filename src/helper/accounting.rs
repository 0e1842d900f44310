//! Login accounting: utmp, wtmp and lastlog
//!
//! The helper only deals in [`UtmpEntry`] values; an [`Accounting`] backend
//! turns them into records. [`SystemAccounting`] writes the real databases,
//! [`RecordingAccounting`] keeps them in memory.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use super::protocol::Database;

/// Login or logout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Login,
    Logout,
}

/// One accounting event for a terminal line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtmpEntry {
    pub kind: EntryKind,
    pub user: String,
    /// Terminal path without `/dev/`
    pub line: String,
    pub id: String,
    pub host: String,
    pub pid: i32,
    pub uid: u32,
    pub time: SystemTime,
}

impl UtmpEntry {
    /// A login entry for the terminal at `tty_path`
    pub fn login(user: &str, uid: u32, host: &str, tty_path: &str, pid: i32) -> Self {
        let line = utmp_line(tty_path);
        UtmpEntry {
            kind: EntryKind::Login,
            user: user.to_string(),
            id: utmp_id(&line),
            line,
            host: host.to_string(),
            pid,
            uid,
            time: SystemTime::now(),
        }
    }

    /// The matching logout entry
    pub fn logout(&self) -> Self {
        UtmpEntry {
            kind: EntryKind::Logout,
            user: String::new(),
            line: self.line.clone(),
            id: self.id.clone(),
            host: String::new(),
            pid: self.pid,
            uid: self.uid,
            time: SystemTime::now(),
        }
    }

    fn since_epoch(&self) -> Duration {
        self.time.duration_since(UNIX_EPOCH).unwrap_or_default()
    }
}

/// Terminal line as stored in utmp: the path without `/dev/`
///
/// Anything but a `pts/N` line is reduced to its last component.
pub fn utmp_line(tty_path: &str) -> String {
    let line = tty_path.strip_prefix("/dev/").unwrap_or(tty_path);
    if line.starts_with("pts") {
        return line.to_string();
    }
    match line.rfind('/') {
        Some(slash) => line[slash + 1..].to_string(),
        None => line.to_string(),
    }
}

/// The utmp id for a line: the suffix of a `pts`/`pty`/`tty` name, or
/// `gtXX` from the first hex number in the line
pub fn utmp_id(line: &str) -> String {
    for prefix in ["pts", "pty", "tty"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    let digits: String = line
        .chars()
        .skip_while(|c| !matches!(c, '0'..='9' | 'a'..='f'))
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    match u32::from_str_radix(&digits, 16) {
        Ok(num) => format!("gt{:02x}", num),
        Err(_) => String::new(),
    }
}

/// Destination for accounting entries
pub trait Accounting {
    fn write_entry(&mut self, database: Database, entry: &UtmpEntry) -> io::Result<()>;
}

/// In-memory backend; clones share the same log
#[derive(Debug, Clone, Default)]
pub struct RecordingAccounting {
    entries: Arc<Mutex<Vec<(Database, UtmpEntry)>>>,
}

impl RecordingAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Database, UtmpEntry)> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Entries of `kind` written to `database`
    pub fn count(&self, database: Database, kind: EntryKind) -> usize {
        self.entries()
            .iter()
            .filter(|(db, entry)| *db == database && entry.kind == kind)
            .count()
    }
}

impl Accounting for RecordingAccounting {
    fn write_entry(&mut self, database: Database, entry: &UtmpEntry) -> io::Result<()> {
        tracing::info!(?database, kind = ?entry.kind, line = %entry.line, user = %entry.user, "Accounting entry");
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "recording lock poisoned"))?;
        entries.push((database, entry.clone()));
        Ok(())
    }
}

/// Size of `ll_line` in a lastlog record
const LASTLOG_LINE: usize = 32;
/// Size of `ll_host` in a lastlog record
const LASTLOG_HOST: usize = 256;
/// `int32 ll_time` followed by line and host
const LASTLOG_RECORD: usize = 4 + LASTLOG_LINE + LASTLOG_HOST;

/// Copy `src` into a fixed field; when `nul` is set the last byte stays 0
fn fill_field(dst: &mut [u8], src: &str, nul: bool) {
    let room = if nul { dst.len().saturating_sub(1) } else { dst.len() };
    let n = src.len().min(room);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

/// One lastlog record, as laid out in the file
fn lastlog_record(entry: &UtmpEntry) -> [u8; LASTLOG_RECORD] {
    let mut record = [0u8; LASTLOG_RECORD];
    let secs = entry.since_epoch().as_secs() as i32;
    record[..4].copy_from_slice(&secs.to_ne_bytes());
    fill_field(&mut record[4..4 + LASTLOG_LINE], &entry.line, false);
    fill_field(&mut record[4 + LASTLOG_LINE..], &entry.host, false);
    record
}

/// Backend writing the system databases
#[derive(Debug, Clone)]
pub struct SystemAccounting {
    wtmp_path: PathBuf,
    lastlog_path: PathBuf,
}

impl SystemAccounting {
    pub fn new(wtmp_path: PathBuf, lastlog_path: PathBuf) -> Self {
        SystemAccounting {
            wtmp_path,
            lastlog_path,
        }
    }

    /// Store `{time, line, host}` at the slot for the entry's uid
    fn write_lastlog(&self, entry: &UtmpEntry) -> io::Result<()> {
        if entry.kind == EntryKind::Logout {
            return Ok(());
        }
        let file = match OpenOptions::new().write(true).open(&self.lastlog_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let offset = u64::from(entry.uid) * LASTLOG_RECORD as u64;
        file.write_all_at(&lastlog_record(entry), offset)
    }
}

#[cfg(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos"))]
mod utmpx {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Write};
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    use super::{fill_field, EntryKind, UtmpEntry};

    const LOCK_ATTEMPTS: u32 = 3;

    fn as_bytes(value: &mut [libc::c_char]) -> &mut [u8] {
        // SAFETY: c_char and u8 have the same size and alignment
        unsafe { std::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), value.len()) }
    }

    pub(super) fn record(entry: &UtmpEntry) -> libc::utmpx {
        // SAFETY: utmpx is plain data; all-zero is a valid empty record
        let mut ut: libc::utmpx = unsafe { std::mem::zeroed() };
        ut.ut_type = match entry.kind {
            EntryKind::Login => libc::USER_PROCESS,
            EntryKind::Logout => libc::DEAD_PROCESS,
        };
        ut.ut_pid = entry.pid;
        fill_field(as_bytes(&mut ut.ut_user), &entry.user, false);
        fill_field(as_bytes(&mut ut.ut_line), &entry.line, true);
        fill_field(as_bytes(&mut ut.ut_id), &entry.id, false);
        fill_field(as_bytes(&mut ut.ut_host), &entry.host, true);
        let since = entry.since_epoch();
        ut.ut_tv.tv_sec = since.as_secs() as _;
        ut.ut_tv.tv_usec = since.subsec_micros() as _;
        ut
    }

    pub(super) fn write_utmp(ut: &libc::utmpx) -> io::Result<()> {
        // SAFETY: the utmpx API copies the record
        let written = unsafe {
            libc::setutxent();
            let written = libc::pututxline(ut);
            libc::endutxent();
            written
        };
        if written.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn lock(mut file: File) -> io::Result<Flock<File>> {
        for attempt in 1..=LOCK_ATTEMPTS {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => return Ok(locked),
                Err((back, Errno::EWOULDBLOCK)) if attempt < LOCK_ATTEMPTS => {
                    file = back;
                    thread::sleep(Duration::from_secs(1));
                },
                Err((_, errno)) => return Err(io::Error::from(errno)),
            }
        }
        Err(io::Error::from(Errno::EWOULDBLOCK))
    }

    /// Append one raw record under an exclusive lock
    pub(super) fn append_wtmp(path: &Path, ut: &libc::utmpx) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(path)?;
        let mut locked = lock(file)?;
        // SAFETY: utmpx is plain data of exactly this size
        let bytes = unsafe {
            std::slice::from_raw_parts((ut as *const libc::utmpx).cast::<u8>(), std::mem::size_of::<libc::utmpx>())
        };
        locked.write_all(bytes)
    }
}

impl Accounting for SystemAccounting {
    #[cfg(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos"))]
    fn write_entry(&mut self, database: Database, entry: &UtmpEntry) -> io::Result<()> {
        match database {
            Database::Utmp => utmpx::write_utmp(&utmpx::record(entry)),
            Database::Wtmp => utmpx::append_wtmp(&self.wtmp_path, &utmpx::record(entry)),
            Database::Lastlog => self.write_lastlog(entry),
        }
    }

    #[cfg(not(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos")))]
    fn write_entry(&mut self, database: Database, entry: &UtmpEntry) -> io::Result<()> {
        match database {
            Database::Lastlog => self.write_lastlog(entry),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no utmpx support for {:?} at {:?}", database, self.wtmp_path),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_strips_dev() {
        assert_eq!(utmp_line("/dev/pts/3"), "pts/3");
        assert_eq!(utmp_line("/dev/ttyp4"), "ttyp4");
        assert_eq!(utmp_line("/dev/pty/m12"), "m12");
    }

    #[test]
    fn test_id_forms() {
        assert_eq!(utmp_id("pts/3"), "/3");
        assert_eq!(utmp_id("ttyp4"), "p4");
        assert_eq!(utmp_id("m1f"), "gt1f");
        assert_eq!(utmp_id("xyz"), "");
    }

    #[test]
    fn test_logout_clears_user_and_host() {
        let login = UtmpEntry::login("alice", 1000, ":0", "/dev/pts/7", 42);
        let logout = login.logout();
        assert_eq!(logout.kind, EntryKind::Logout);
        assert_eq!(logout.line, "pts/7");
        assert_eq!(logout.id, login.id);
        assert!(logout.user.is_empty());
        assert!(logout.host.is_empty());
    }

    #[test]
    fn test_recording_counts() {
        let mut recorder = RecordingAccounting::new();
        let shared = recorder.clone();
        let login = UtmpEntry::login("bob", 1001, "localhost", "/dev/pts/1", 7);
        recorder.write_entry(Database::Utmp, &login).unwrap();
        recorder.write_entry(Database::Utmp, &login.logout()).unwrap();
        assert_eq!(shared.count(Database::Utmp, EntryKind::Login), 1);
        assert_eq!(shared.count(Database::Utmp, EntryKind::Logout), 1);
        assert_eq!(shared.count(Database::Wtmp, EntryKind::Login), 0);
    }

    #[test]
    fn test_lastlog_slot_for_uid() {
        let dir = tempfile::tempdir().unwrap();
        let lastlog = dir.path().join("lastlog");
        std::fs::write(&lastlog, b"").unwrap();

        let mut accounting = SystemAccounting::new(dir.path().join("wtmp"), lastlog.clone());
        let entry = UtmpEntry::login("carol", 3, "remote", "/dev/pts/9", 1);
        accounting.write_entry(Database::Lastlog, &entry).unwrap();
        accounting.write_entry(Database::Lastlog, &entry.logout()).unwrap();

        let data = std::fs::read(&lastlog).unwrap();
        assert_eq!(data.len(), 4 * LASTLOG_RECORD);
        let slot = &data[3 * LASTLOG_RECORD..];
        assert_eq!(&slot[4..9], b"pts/9");
        assert_eq!(&slot[4 + LASTLOG_LINE..4 + LASTLOG_LINE + 6], b"remote");
    }

    #[test]
    fn test_missing_lastlog_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut accounting = SystemAccounting::new(dir.path().join("wtmp"), dir.path().join("absent"));
        let entry = UtmpEntry::login("dave", 5, "localhost", "/dev/pts/2", 1);
        assert!(accounting.write_entry(Database::Lastlog, &entry).is_ok());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_wtmp_append() {
        let dir = tempfile::tempdir().unwrap();
        let wtmp = dir.path().join("wtmp");
        std::fs::write(&wtmp, b"").unwrap();

        let mut accounting = SystemAccounting::new(wtmp.clone(), dir.path().join("lastlog"));
        let entry = UtmpEntry::login("erin", 6, "localhost", "/dev/pts/4", 99);
        accounting.write_entry(Database::Wtmp, &entry).unwrap();
        accounting.write_entry(Database::Wtmp, &entry.logout()).unwrap();

        let size = std::fs::metadata(&wtmp).unwrap().len() as usize;
        assert_eq!(size, 2 * std::mem::size_of::<libc::utmpx>());
    }
}
