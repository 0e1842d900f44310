//! Spawn request assembly
//!
//! A [`SpawnConfig`] describes one exec request against a PTY. It is built
//! once, validated, and then moved into a
//! [`SpawnOperation`](super::SpawnOperation).

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::environ;
use crate::error::SpawnError;
use crate::pty::PtyHandle;

/// Callback run in the child after chdir and before exec
///
/// It runs in a forked child: it must not allocate, lock or log.
pub type ChildSetupFn = Box<dyn FnMut() + Send>;

/// A descriptor the child keeps, optionally under a new number
#[derive(Debug)]
pub struct FdMapping {
    fd: OwnedFd,
    target: Option<RawFd>,
}

impl FdMapping {
    /// Keep `fd` under its current number
    pub fn keep(fd: OwnedFd) -> Self {
        FdMapping { fd, target: None }
    }

    /// Move `fd` to `target` in the child
    pub fn to(fd: OwnedFd, target: RawFd) -> Self {
        FdMapping {
            fd,
            target: Some(target),
        }
    }

    /// Descriptor number in the parent
    pub fn source(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Descriptor number in the child
    pub fn target(&self) -> RawFd {
        self.target.unwrap_or_else(|| self.fd.as_raw_fd())
    }
}

/// One exec request: program, arguments, environment, directories,
/// descriptors and policy
pub struct SpawnConfig {
    pub(crate) pty: PtyHandle,
    pub(crate) program: OsString,
    pub(crate) argv: Vec<OsString>,
    pub(crate) env: Vec<OsString>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) fallback_cwd: Option<PathBuf>,
    pub(crate) fds: Vec<FdMapping>,
    pub(crate) child_setup: Option<ChildSetupFn>,
    pub(crate) inherit_environ: bool,
    pub(crate) scope: bool,
    pub(crate) require_scope: bool,
    pub(crate) search_path: bool,
}

impl SpawnConfig {
    /// Start a request; `argv[0]` is also the program to execute
    pub fn new<I, S>(pty: PtyHandle, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv: Vec<OsString> = argv.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        SpawnConfig {
            pty,
            program: argv.first().cloned().unwrap_or_default(),
            argv,
            env: Vec::new(),
            cwd: None,
            fallback_cwd: None,
            fds: Vec::new(),
            child_setup: None,
            inherit_environ: true,
            scope: true,
            require_scope: false,
            search_path: false,
        }
    }

    /// Execute `program` instead of `argv[0]`
    pub fn program<S: AsRef<OsStr>>(mut self, program: S) -> Self {
        self.program = program.as_ref().to_os_string();
        self
    }

    /// Set one environment variable
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        let mut entry = key.as_ref().to_os_string();
        entry.push("=");
        entry.push(value.as_ref());
        self.env.push(entry);
        self
    }

    /// Remove a variable the child would otherwise inherit
    pub fn env_remove<K: AsRef<OsStr>>(mut self, key: K) -> Self {
        self.env.push(key.as_ref().to_os_string());
        self
    }

    /// Add raw `NAME=VALUE` entries
    pub fn envs<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.env.extend(entries.into_iter().map(|e| e.as_ref().to_os_string()));
        self
    }

    /// Working directory for the child
    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Directory to use if the working directory is inaccessible
    pub fn fallback_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.fallback_cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Keep a descriptor open in the child
    pub fn keep_fd(mut self, fd: OwnedFd) -> Self {
        self.fds.push(FdMapping::keep(fd));
        self
    }

    /// Pass a descriptor to the child as `target`
    pub fn map_fd(mut self, fd: OwnedFd, target: RawFd) -> Self {
        self.fds.push(FdMapping::to(fd, target));
        self
    }

    /// Run `setup` in the child right before exec
    pub fn child_setup<F>(mut self, setup: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.child_setup = Some(Box::new(setup));
        self
    }

    /// Start from the parent environment (default: true)
    pub fn inherit_environment(mut self, inherit: bool) -> Self {
        self.inherit_environ = inherit;
        self
    }

    /// Move the child into its own systemd scope (default: true)
    pub fn scope(mut self, scope: bool) -> Self {
        self.scope = scope;
        self
    }

    /// Fail the spawn if the scope cannot be created (default: false)
    pub fn require_scope(mut self, require: bool) -> Self {
        self.require_scope = require;
        self
    }

    /// Look the program up in `PATH` (default: false)
    pub fn search_path(mut self, search: bool) -> Self {
        self.search_path = search;
        self
    }

    pub fn pty(&self) -> &PtyHandle {
        &self.pty
    }

    /// `argv[0]`, used to name the program in errors
    pub fn arg0(&self) -> String {
        self.argv
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// Environment entries; after preparation this is the child's full environment
    pub fn environment(&self) -> &[OsString] {
        &self.env
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn fd_mappings(&self) -> &[FdMapping] {
        &self.fds
    }

    /// Replace the caller overrides with the merged child environment
    pub fn prepare_environment(&mut self) {
        self.env = environ::prepare_environment(self.inherit_environ, &self.env, self.cwd.as_deref());
    }

    /// Check the request before anything is forked
    pub fn validate(&self) -> Result<(), SpawnError> {
        if self.argv.is_empty() {
            return Err(SpawnError::InvalidConfig("argument vector is empty".to_string()));
        }

        let has_nul = |s: &OsStr| s.as_bytes().contains(&0);
        if has_nul(self.program.as_os_str()) || self.argv.iter().any(|a| has_nul(a.as_os_str())) {
            return Err(SpawnError::InvalidConfig("argument contains a NUL byte".to_string()));
        }
        if self.env.iter().any(|e| has_nul(e.as_os_str())) {
            return Err(SpawnError::InvalidConfig("environment contains a NUL byte".to_string()));
        }
        for dir in [&self.cwd, &self.fallback_cwd].into_iter().flatten() {
            if has_nul(dir.as_os_str()) {
                return Err(SpawnError::InvalidConfig(format!(
                    "directory {:?} contains a NUL byte",
                    dir
                )));
            }
        }

        validate_fd_targets(self.fds.iter().map(FdMapping::target))?;

        if self.require_scope && !self.scope {
            return Err(SpawnError::InvalidConfig(
                "a scope is required but scope creation is disabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Targets must be unique and clear of stdin, stdout and stderr
pub fn validate_fd_targets<I: IntoIterator<Item = RawFd>>(targets: I) -> Result<(), SpawnError> {
    let mut seen = HashSet::new();
    for target in targets {
        if target < 3 {
            return Err(SpawnError::InvalidConfig(format!(
                "descriptor target {} collides with standard streams",
                target
            )));
        }
        if !seen.insert(target) {
            return Err(SpawnError::InvalidConfig(format!(
                "descriptor target {} is used twice",
                target
            )));
        }
    }
    Ok(())
}

impl fmt::Debug for SpawnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnConfig")
            .field("master", &self.pty.master_fd())
            .field("program", &self.program)
            .field("argv", &self.argv)
            .field("env", &self.env.len())
            .field("cwd", &self.cwd)
            .field("fallback_cwd", &self.fallback_cwd)
            .field("fds", &self.fds)
            .field("child_setup", &self.child_setup.is_some())
            .field("inherit_environ", &self.inherit_environ)
            .field("scope", &self.scope)
            .field("require_scope", &self.require_scope)
            .field("search_path", &self.search_path)
            .finish()
    }
}
