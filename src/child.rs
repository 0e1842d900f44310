//! Code that runs in the child between fork and exec
//!
//! After `fork()` the child holds a copy of every lock other threads had
//! taken, so nothing here allocates, locks or logs. [`ChildExec::new`]
//! builds every C string, pointer array and candidate path in the parent;
//! the child only reads those buffers and issues raw syscalls.
//!
//! A failing step never returns to the caller's code. The child writes a
//! `{step, errno}` record to the report pipe and exits with
//! [`CHILD_EXIT_STATUS`].

use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::ptr;

use libc::c_char;
use nix::errno::Errno;

use crate::error::SpawnError;
use crate::pty::{NativePlatform, PtyFlags, PtyPlatform};
use crate::spawn::SpawnConfig;

/// Exit status of a child that failed before exec
pub const CHILD_EXIT_STATUS: libc::c_int = 127;

/// Search path used when neither the child nor the parent has `PATH`
pub const DEFAULT_SEARCH_PATH: &str = "/bin:/usr/bin";

/// Size in bytes of the failure record written to the report pipe
pub const REPORT_LEN: usize = 2 * std::mem::size_of::<i32>();

/// Interpreter for programs the kernel refuses with `ENOEXEC`
const SHELL: &[u8] = b"/bin/sh\0";

#[cfg(target_os = "linux")]
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Highest signal number plus one
#[cfg(any(target_os = "linux", target_os = "android"))]
const SIGNAL_LIMIT: libc::c_int = 65;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SIGNAL_LIMIT: libc::c_int = 32;

/// The child setup step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExecStep {
    Unknown = 0,
    SignalMask = 1,
    Setsid = 2,
    OpenPeer = 3,
    ControllingTty = 4,
    LineDiscipline = 5,
    DupStdio = 6,
    Relocate = 7,
    Dup2 = 8,
    UnsetCloexec = 9,
    Chdir = 10,
    Exec = 11,
}

impl ExecStep {
    /// Decode a step number read from the report pipe
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ExecStep::SignalMask,
            2 => ExecStep::Setsid,
            3 => ExecStep::OpenPeer,
            4 => ExecStep::ControllingTty,
            5 => ExecStep::LineDiscipline,
            6 => ExecStep::DupStdio,
            7 => ExecStep::Relocate,
            8 => ExecStep::Dup2,
            9 => ExecStep::UnsetCloexec,
            10 => ExecStep::Chdir,
            11 => ExecStep::Exec,
            _ => ExecStep::Unknown,
        }
    }
}

impl fmt::Display for ExecStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecStep::Unknown => "unknown step",
            ExecStep::SignalMask => "unblocking signals",
            ExecStep::Setsid => "starting a new session",
            ExecStep::OpenPeer => "opening the PTY peer",
            ExecStep::ControllingTty => "setting the controlling terminal",
            ExecStep::LineDiscipline => "pushing line discipline modules",
            ExecStep::DupStdio => "attaching the PTY to standard streams",
            ExecStep::Relocate => "relocating a file descriptor",
            ExecStep::Dup2 => "remapping a file descriptor",
            ExecStep::UnsetCloexec => "clearing close-on-exec",
            ExecStep::Chdir => "changing directory",
            ExecStep::Exec => "executing the program",
        };
        f.write_str(name)
    }
}

/// A failed step and its errno, as carried over the report pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildFailure {
    pub step: ExecStep,
    pub errno: Errno,
}

impl ChildFailure {
    pub fn new(step: ExecStep, errno: Errno) -> Self {
        ChildFailure { step, errno }
    }

    fn last(step: ExecStep) -> Self {
        ChildFailure::new(step, Errno::last())
    }

    /// Native-endian `{step, errno}` pair
    pub fn encode(&self) -> [u8; REPORT_LEN] {
        let mut buf = [0u8; REPORT_LEN];
        buf[..4].copy_from_slice(&(self.step as i32).to_ne_bytes());
        buf[4..].copy_from_slice(&(self.errno as i32).to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REPORT_LEN]) -> Self {
        let step = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let errno = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
        ChildFailure::new(ExecStep::from_raw(step), Errno::from_raw(errno))
    }
}

/// chdir errors that mean the directory cannot be reached, so the fallback
/// directory may be tried
pub fn is_inaccessible(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::ENOENT | Errno::EACCES | Errno::ENOTDIR | Errno::ELOOP | Errno::EPERM
    )
}

/// Unblock every signal and restore default dispositions
///
/// `SIGKILL` and `SIGSTOP` cannot be changed and are skipped; errors for
/// signal numbers the C library reserves are ignored.
pub(crate) fn reset_signals() -> Result<(), ChildFailure> {
    // SAFETY: sigset_t is plain data, and these calls are async-signal-safe
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        let rv = libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut());
        if rv != 0 {
            return Err(ChildFailure::new(ExecStep::SignalMask, Errno::from_raw(rv)));
        }
        for signo in 1..SIGNAL_LIMIT {
            if signo == libc::SIGKILL || signo == libc::SIGSTOP {
                continue;
            }
            libc::signal(signo, libc::SIG_DFL);
        }
    }
    Ok(())
}

/// Become a session leader unless the flags say otherwise
pub(crate) fn start_session(flags: PtyFlags) -> Result<(), ChildFailure> {
    if flags.no_session {
        return Ok(());
    }
    // SAFETY: setsid has no memory effects
    if unsafe { libc::setsid() } == -1 {
        return Err(ChildFailure::last(ExecStep::Setsid));
    }
    Ok(())
}

/// Open the peer and make it this session's terminal
pub(crate) fn open_terminal(master: RawFd, flags: PtyFlags) -> Result<RawFd, ChildFailure> {
    let peer = NativePlatform::open_peer(master, flags)
        .map_err(|errno| ChildFailure::new(ExecStep::OpenPeer, errno))?;
    NativePlatform::acquire_controlling_tty(peer, flags)
        .map_err(|errno| ChildFailure::new(ExecStep::ControllingTty, errno))?;
    NativePlatform::push_line_discipline(peer)
        .map_err(|errno| ChildFailure::new(ExecStep::LineDiscipline, errno))?;
    Ok(peer)
}

/// Put the peer on descriptors 0, 1 and 2
pub(crate) fn dup_stdio(peer: RawFd) -> Result<(), ChildFailure> {
    for target in 0..=2 {
        if peer == target {
            clear_cloexec(target).map_err(|errno| ChildFailure::new(ExecStep::DupStdio, errno))?;
        } else {
            dup2_retry(peer, target).map_err(|errno| ChildFailure::new(ExecStep::DupStdio, errno))?;
        }
    }
    if peer > 2 {
        // SAFETY: the peer is ours and is no longer needed
        unsafe { libc::close(peer) };
    }
    Ok(())
}

fn dup2_retry(source: RawFd, target: RawFd) -> Result<(), Errno> {
    loop {
        // SAFETY: dup2 only manipulates the descriptor table
        if unsafe { libc::dup2(source, target) } != -1 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EINTR | Errno::EBUSY => continue,
            e => return Err(e),
        }
    }
}

fn clear_cloexec(fd: RawFd) -> Result<(), Errno> {
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(Errno::last());
        }
        if flags & libc::FD_CLOEXEC != 0 && libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
            return Err(Errno::last());
        }
    }
    Ok(())
}

/// Mark every descriptor from `low` upwards close-on-exec
///
/// Uses `close_range` where the kernel has it and otherwise walks up to
/// `max_fd`, which the parent computed before forking.
fn mark_cloexec_from(low: RawFd, max_fd: RawFd) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range with CLOSE_RANGE_CLOEXEC only sets descriptor flags
        let rv = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                low as libc::c_uint,
                libc::c_uint::MAX,
                CLOSE_RANGE_CLOEXEC,
            )
        };
        if rv == 0 {
            return;
        }
    }
    for fd in low..=max_fd {
        // SAFETY: fcntl on a closed descriptor fails with EBADF and does nothing
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 && flags & libc::FD_CLOEXEC == 0 {
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
    }
}

/// Highest descriptor number the fallback close-on-exec walk must cover
///
/// Allocates, so it has to run in the parent.
pub(crate) fn max_open_fd() -> RawFd {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
            return entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<RawFd>().ok()))
                .max()
                .unwrap_or(1024);
        }
    }

    // SAFETY: sysconf has no memory effects
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max > 0 {
        std::cmp::min(max, 65536) as RawFd
    } else {
        1024
    }
}

/// The `PATH` a search should walk: the child's own, else the parent's,
/// else [`DEFAULT_SEARCH_PATH`]
pub fn search_path_for(envp: &[OsString], parent_path: Option<OsString>) -> OsString {
    envp.iter()
        .find_map(|entry| entry.as_bytes().strip_prefix(b"PATH="))
        .map(|value| OsStr::from_bytes(value).to_os_string())
        .or(parent_path)
        .unwrap_or_else(|| OsString::from(DEFAULT_SEARCH_PATH))
}

/// Paths to hand to `execve`, in order
///
/// A program containing a slash, or any program when `search` is `None`,
/// is tried as given. Otherwise each `search` element is prefixed to it;
/// an empty element means the current directory.
pub fn exec_candidates(program: &OsStr, search: Option<&OsStr>) -> Vec<OsString> {
    let bytes = program.as_bytes();
    if bytes.is_empty() {
        return Vec::new();
    }
    let search = match search {
        Some(search) if !bytes.contains(&b'/') => search,
        _ => return vec![program.to_os_string()],
    };

    search
        .as_bytes()
        .split(|&b| b == b':')
        .map(|dir| {
            if dir.is_empty() {
                program.to_os_string()
            } else {
                let mut path = Vec::with_capacity(dir.len() + 1 + bytes.len());
                path.extend_from_slice(dir);
                if !dir.ends_with(b"/") {
                    path.push(b'/');
                }
                path.extend_from_slice(bytes);
                OsString::from(OsStr::from_bytes(&path))
            }
        })
        .collect()
}

fn to_cstring(value: &OsStr) -> Result<CString, SpawnError> {
    CString::new(value.as_bytes())
        .map_err(|_| SpawnError::InvalidConfig(format!("{:?} contains a NUL byte", value)))
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// One entry of the descriptor remap table
///
/// A negative `target` marks a descriptor that only needs to survive the
/// remapping (the report pipe). A negative `source` marks a finished entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FdSlot {
    source: RawFd,
    target: RawFd,
}

/// Everything the child needs, prepared before fork
pub struct ChildExec<'a> {
    master: RawFd,
    flags: PtyFlags,
    argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp: Vec<CString>,
    envp_ptrs: Vec<*const c_char>,
    candidates: Vec<CString>,
    shell_argv: Vec<*const c_char>,
    cwd: Option<CString>,
    fallback_cwd: Option<CString>,
    fd_map: Vec<FdSlot>,
    max_fd: RawFd,
    setup: Option<&'a mut (dyn FnMut() + Send + 'static)>,
}

impl<'a> ChildExec<'a> {
    /// Build the exec plan for `config`, with `report_fd` as the pipe's
    /// write end
    pub(crate) fn new(config: &'a mut SpawnConfig, report_fd: RawFd) -> Result<Self, SpawnError> {
        let argv = config
            .argv
            .iter()
            .map(|a| to_cstring(a))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = config
            .env
            .iter()
            .map(|e| to_cstring(e))
            .collect::<Result<Vec<_>, _>>()?;
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        let search = config
            .search_path
            .then(|| search_path_for(&config.env, std::env::var_os("PATH")));
        let candidates = exec_candidates(&config.program, search.as_deref())
            .iter()
            .map(|c| to_cstring(c))
            .collect::<Result<Vec<_>, _>>()?;

        let mut shell_argv = Vec::with_capacity(argv.len() + 2);
        shell_argv.push(SHELL.as_ptr().cast::<c_char>());
        shell_argv.push(ptr::null());
        shell_argv.extend_from_slice(&argv_ptrs[1..]);

        let cwd = config.cwd.as_deref().map(|p| to_cstring(p.as_os_str())).transpose()?;
        let fallback_cwd = config
            .fallback_cwd
            .as_deref()
            .map(|p| to_cstring(p.as_os_str()))
            .transpose()?;

        let mut fd_map = Vec::with_capacity(4 + config.fds.len());
        fd_map.extend((0..3).map(|target| FdSlot { source: -1, target }));
        fd_map.push(FdSlot {
            source: report_fd,
            target: -1,
        });
        fd_map.extend(config.fds.iter().map(|m| FdSlot {
            source: m.source(),
            target: m.target(),
        }));

        Ok(ChildExec {
            master: config.pty.master_fd(),
            flags: config.pty.flags(),
            argv,
            argv_ptrs,
            envp,
            envp_ptrs,
            candidates,
            shell_argv,
            cwd,
            fallback_cwd,
            fd_map,
            max_fd: max_open_fd(),
            setup: config.child_setup.as_deref_mut(),
        })
    }

    /// Run every step and exec the program
    ///
    /// Only returns if a step failed. `report_fd` is updated if the report
    /// pipe had to be moved out of the way of a remap target.
    ///
    /// # Safety
    /// Only call this in a freshly forked child.
    pub(crate) unsafe fn run(&mut self, report_fd: &mut RawFd) -> ChildFailure {
        match self.run_steps(report_fd) {
            Ok(never) => match never {},
            Err(failure) => failure,
        }
    }

    unsafe fn run_steps(&mut self, report_fd: &mut RawFd) -> Result<Infallible, ChildFailure> {
        reset_signals()?;
        start_session(self.flags)?;
        let peer = open_terminal(self.master, self.flags)?;

        for slot in &mut self.fd_map[..3] {
            slot.source = peer;
        }
        mark_cloexec_from(3, self.max_fd);
        self.remap(report_fd)?;
        if peer > 2 && !self.fd_map.iter().any(|slot| slot.target == peer) {
            libc::close(peer);
        }

        self.change_dir()?;

        if let Some(setup) = self.setup.as_deref_mut() {
            setup();
        }

        Err(self.exec())
    }

    /// Move every source descriptor onto its target
    ///
    /// A descriptor still needed by a later entry that sits on the current
    /// target is first duplicated out of the way.
    fn remap(&mut self, report_fd: &mut RawFd) -> Result<(), ChildFailure> {
        for i in 0..self.fd_map.len() {
            let FdSlot { source, target } = self.fd_map[i];
            if target < 0 {
                continue;
            }

            if source == target {
                clear_cloexec(target).map_err(|e| ChildFailure::new(ExecStep::UnsetCloexec, e))?;
            } else {
                if let Some(j) = self.fd_map.iter().position(|slot| slot.source == target) {
                    // SAFETY: F_DUPFD_CLOEXEC only creates a new descriptor
                    let moved = unsafe { libc::fcntl(target, libc::F_DUPFD_CLOEXEC, 3) };
                    if moved == -1 {
                        return Err(ChildFailure::last(ExecStep::Relocate));
                    }
                    for slot in &mut self.fd_map[j..] {
                        if slot.source == target {
                            slot.source = moved;
                        }
                    }
                    if target == *report_fd {
                        *report_fd = moved;
                    } else {
                        // SAFETY: every user of the old number now points at `moved`
                        unsafe { libc::close(target) };
                    }
                }
                dup2_retry(source, target).map_err(|e| ChildFailure::new(ExecStep::Dup2, e))?;
            }
            self.fd_map[i].source = -1;
        }
        Ok(())
    }

    fn change_dir(&self) -> Result<(), ChildFailure> {
        let Some(cwd) = &self.cwd else {
            return Ok(());
        };
        // SAFETY: cwd is a valid C string
        if unsafe { libc::chdir(cwd.as_ptr()) } == 0 {
            return Ok(());
        }
        let errno = Errno::last();
        if let Some(fallback) = &self.fallback_cwd {
            if is_inaccessible(errno) && unsafe { libc::chdir(fallback.as_ptr()) } == 0 {
                return Ok(());
            }
        }
        Err(ChildFailure::new(ExecStep::Chdir, errno))
    }

    /// Try each candidate path; returns the failure to report
    unsafe fn exec(&mut self) -> ChildFailure {
        if self.candidates.is_empty() {
            return ChildFailure::new(ExecStep::Exec, Errno::ENOENT);
        }

        let mut saw_eacces = false;
        let mut last = Errno::ENOENT;
        for candidate in &self.candidates {
            let path = candidate.as_ptr();
            libc::execve(path, self.argv_ptrs.as_ptr(), self.envp_ptrs.as_ptr());
            let mut errno = Errno::last();

            if errno == Errno::ENOEXEC {
                self.shell_argv[1] = path;
                libc::execve(
                    SHELL.as_ptr().cast(),
                    self.shell_argv.as_ptr(),
                    self.envp_ptrs.as_ptr(),
                );
                errno = Errno::last();
            }

            match errno {
                Errno::EACCES => saw_eacces = true,
                Errno::ENOENT | Errno::ESTALE | Errno::ENOTDIR | Errno::ENODEV | Errno::ETIMEDOUT => {},
                other => return ChildFailure::new(ExecStep::Exec, other),
            }
            last = errno;
        }

        ChildFailure::new(ExecStep::Exec, if saw_eacces { Errno::EACCES } else { last })
    }

    /// Number of C strings the plan holds, argv and envp together
    pub(crate) fn string_count(&self) -> usize {
        self.argv.len() + self.envp.len()
    }
}

/// Write a failure record to the report pipe
///
/// # Safety
/// Async-signal-safe; `fd` must be the pipe's write end.
pub(crate) unsafe fn write_report(fd: RawFd, failure: ChildFailure) {
    let buf = failure.encode();
    let mut written = 0;
    while written < buf.len() {
        let n = libc::write(fd, buf[written..].as_ptr().cast(), buf.len() - written);
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return;
        }
        written += n as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(s: &str) -> OsString {
        OsString::from(s)
    }

    #[test]
    fn test_report_encoding() {
        let failure = ChildFailure::new(ExecStep::Chdir, Errno::EACCES);
        assert_eq!(ChildFailure::decode(&failure.encode()), failure);
    }

    #[test]
    fn test_unknown_step_decodes_as_unknown() {
        assert_eq!(ExecStep::from_raw(999), ExecStep::Unknown);
        assert_eq!(ExecStep::from_raw(ExecStep::Exec as i32), ExecStep::Exec);
    }

    #[test]
    fn test_inaccessible_errors() {
        assert!(is_inaccessible(Errno::ENOENT));
        assert!(is_inaccessible(Errno::EACCES));
        assert!(is_inaccessible(Errno::ENOTDIR));
        assert!(!is_inaccessible(Errno::EIO));
        assert!(!is_inaccessible(Errno::ENOMEM));
    }

    #[test]
    fn test_candidates_without_search() {
        assert_eq!(exec_candidates(OsStr::new("sh"), None), vec![os("sh")]);
        assert!(exec_candidates(OsStr::new(""), Some(OsStr::new("/bin"))).is_empty());
    }

    #[test]
    fn test_candidates_with_slash_skip_search() {
        let c = exec_candidates(OsStr::new("./run"), Some(OsStr::new("/bin:/usr/bin")));
        assert_eq!(c, vec![os("./run")]);
    }

    #[test]
    fn test_candidates_walk_search_path() {
        let c = exec_candidates(OsStr::new("ls"), Some(OsStr::new("/usr/local/bin::/bin/")));
        assert_eq!(c, vec![os("/usr/local/bin/ls"), os("ls"), os("/bin/ls")]);
    }

    #[test]
    fn test_search_path_prefers_child_environment() {
        let envp = vec![os("HOME=/root"), os("PATH=/opt/bin")];
        assert_eq!(search_path_for(&envp, Some(os("/usr/bin"))), os("/opt/bin"));
        assert_eq!(search_path_for(&[], Some(os("/usr/bin"))), os("/usr/bin"));
        assert_eq!(search_path_for(&[], None), os(DEFAULT_SEARCH_PATH));
    }

    #[test]
    fn test_step_display() {
        assert_eq!(ExecStep::Chdir.to_string(), "changing directory");
    }
}
