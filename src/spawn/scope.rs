//! Moving spawned children into their own systemd scope
//!
//! When the spawning process itself runs inside a systemd user unit, each
//! child gets a transient `.scope` unit so the user manager accounts for it
//! separately. This is best effort unless the spawn asked for it to be
//! required.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::Pid;
use thiserror::Error;
use zbus::blocking::Connection;
use zbus::zvariant::{OwnedObjectPath, Value};

/// Slice used when the caller's own slice cannot be determined
pub const FALLBACK_SLICE: &str = "app-mochi.slice";

/// Error type for scope creation
#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("not running inside a systemd user unit")]
    Unavailable,

    #[error("invalid process id {0}")]
    InvalidPid(i32),

    #[error("D-Bus call failed: {0}")]
    Bus(#[from] zbus::Error),
}

/// Something that can place a process into an isolated scope
pub trait ScopeManager: Send + Sync + fmt::Debug {
    /// Whether `attach` has any chance of working in this process
    fn is_available(&self) -> bool;

    /// Move `pid` into a new scope
    fn attach(&self, pid: Pid) -> Result<(), ScopeError>;
}

/// A scope manager that never attaches anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScope;

impl ScopeManager for NoScope {
    fn is_available(&self) -> bool {
        false
    }

    fn attach(&self, _pid: Pid) -> Result<(), ScopeError> {
        Err(ScopeError::Unavailable)
    }
}

/// Where the calling process sits in the user manager's cgroup tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UserCgroup {
    pub unit: String,
    pub slice: Option<String>,
}

/// Find the user unit and slice in `/proc/<pid>/cgroup` contents
pub(crate) fn parse_user_cgroup(contents: &str) -> Option<UserCgroup> {
    let path = contents.lines().find_map(|line| {
        let mut parts = line.splitn(3, ':');
        let (_, controllers, path) = (parts.next()?, parts.next()?, parts.next()?);
        (controllers.is_empty() || controllers == "name=systemd").then_some(path)
    })?;

    let mut components = path.split('/').filter(|c| !c.is_empty());
    components
        .by_ref()
        .find(|c| c.starts_with("user@") && c.ends_with(".service"))?;

    let mut slice = None;
    for component in components {
        if component.ends_with(".slice") {
            slice = Some(component.to_string());
        } else if component.ends_with(".service") || component.ends_with(".scope") {
            return Some(UserCgroup {
                unit: component.to_string(),
                slice,
            });
        }
    }
    None
}

/// Transient scope units through the user's systemd instance
#[derive(Debug, Clone)]
pub struct SystemdScope {
    cgroup_file: PathBuf,
    fallback_slice: String,
}

impl Default for SystemdScope {
    fn default() -> Self {
        SystemdScope {
            cgroup_file: PathBuf::from("/proc/self/cgroup"),
            fallback_slice: FALLBACK_SLICE.to_string(),
        }
    }
}

impl SystemdScope {
    fn user_cgroup(&self) -> Option<UserCgroup> {
        let contents = fs::read_to_string(&self.cgroup_file).ok()?;
        parse_user_cgroup(&contents)
    }
}

fn program_name() -> String {
    std::env::args_os()
        .next()
        .map(PathBuf::from)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "mochi".to_string())
}

/// `mochi-spawn-<pid>-<nonce>.scope`
pub(crate) fn scope_unit_name(pid: Pid) -> String {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("mochi-spawn-{}-{:x}.scope", pid, nonce)
}

impl ScopeManager for SystemdScope {
    fn is_available(&self) -> bool {
        self.user_cgroup().is_some()
    }

    fn attach(&self, pid: Pid) -> Result<(), ScopeError> {
        let cgroup = self.user_cgroup().ok_or(ScopeError::Unavailable)?;
        let slice = cgroup.slice.unwrap_or_else(|| self.fallback_slice.clone());
        let raw_pid = u32::try_from(pid.as_raw()).map_err(|_| ScopeError::InvalidPid(pid.as_raw()))?;

        let unit = scope_unit_name(pid);
        let description = format!(
            "mochi child process {} launched by {} process {}",
            pid,
            program_name(),
            std::process::id()
        );

        let properties: Vec<(&str, Value<'_>)> = vec![
            ("Description", Value::new(description.as_str())),
            ("PIDs", Value::new(vec![raw_pid])),
            ("Slice", Value::new(slice.as_str())),
        ];
        let aux: Vec<(String, Vec<(String, Value<'_>)>)> = Vec::new();

        let connection = Connection::session()?;
        let reply = connection.call_method(
            Some("org.freedesktop.systemd1"),
            "/org/freedesktop/systemd1",
            Some("org.freedesktop.systemd1.Manager"),
            "StartTransientUnit",
            &(unit.as_str(), "fail", properties, aux),
        )?;
        let job: OwnedObjectPath = reply.body().deserialize()?;

        tracing::debug!(%pid, unit = %unit, slice = %slice, job = %job.as_str(), "Started transient scope");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_unit_and_slice() {
        let contents = "0::/user.slice/user-1000.slice/user@1000.service/app.slice/app-mochi-42.scope\n";
        let cgroup = parse_user_cgroup(contents).expect("expected a user unit");
        assert_eq!(cgroup.unit, "app-mochi-42.scope");
        assert_eq!(cgroup.slice.as_deref(), Some("app.slice"));
    }

    #[test]
    fn test_parse_unit_without_slice() {
        let contents = "0::/user.slice/user-1000.slice/user@1000.service/foo.service";
        let cgroup = parse_user_cgroup(contents).expect("expected a user unit");
        assert_eq!(cgroup.unit, "foo.service");
        assert_eq!(cgroup.slice, None);
    }

    #[test]
    fn test_system_service_is_not_a_user_unit() {
        assert_eq!(parse_user_cgroup("0::/system.slice/sshd.service\n"), None);
        assert_eq!(parse_user_cgroup("0::/user.slice/user-1000.slice/session-2.scope\n"), None);
    }

    #[test]
    fn test_cgroup_v1_uses_systemd_hierarchy() {
        let contents = "\
            12:cpu,cpuacct:/\n\
            1:name=systemd:/user.slice/user-1000.slice/user@1000.service/app.slice/term.scope\n";
        let cgroup = parse_user_cgroup(contents).expect("expected a user unit");
        assert_eq!(cgroup.unit, "term.scope");
    }

    #[test]
    fn test_unit_name_shape() {
        let name = scope_unit_name(Pid::from_raw(1234));
        assert!(name.starts_with("mochi-spawn-1234-"));
        assert!(name.ends_with(".scope"));
    }

    #[test]
    fn test_no_scope_is_unavailable() {
        assert!(!NoScope.is_available());
        assert!(NoScope.attach(Pid::from_raw(1)).is_err());
    }

    #[test]
    fn test_missing_cgroup_file_is_unavailable() {
        let scope = SystemdScope {
            cgroup_file: PathBuf::from("/nonexistent/cgroup"),
            fallback_slice: FALLBACK_SLICE.to_string(),
        };
        assert!(!scope.is_available());
    }
}
