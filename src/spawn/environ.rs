//! Environment preparation for spawned children
//!
//! Merge order, lowest precedence first:
//!
//! 1. the parent environment, when inheritance is on
//! 2. `TERM=xterm-256color`
//! 3. caller overrides
//! 4. `MOCHI_PTY_VERSION` and `COLORTERM=truecolor`
//! 5. `PWD`, when a working directory was given
//!
//! An override without `=` removes the name. The result is sorted by name.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Terminal type every child gets unless the caller overrides it
pub const TERM_DEFAULT: &str = "xterm-256color";

/// Version marker variable; callers cannot override it
pub const VERSION_VAR: &str = "MOCHI_PTY_VERSION";

/// Color capability advertised to every child
pub const COLORTERM_VALUE: &str = "truecolor";

/// This crate's version as `major * 10000 + minor * 100 + patch`
pub fn version_number() -> u32 {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0);
    part(env!("CARGO_PKG_VERSION_MAJOR")) * 10000
        + part(env!("CARGO_PKG_VERSION_MINOR")) * 100
        + part(env!("CARGO_PKG_VERSION_PATCH"))
}

/// Split `NAME=VALUE`; a missing `=` yields no value
fn split_entry(entry: &OsStr) -> (OsString, Option<OsString>) {
    let bytes = entry.as_bytes();
    match bytes.iter().position(|&b| b == b'=') {
        Some(eq) => (
            OsStr::from_bytes(&bytes[..eq]).to_os_string(),
            Some(OsStr::from_bytes(&bytes[eq + 1..]).to_os_string()),
        ),
        None => (entry.to_os_string(), None),
    }
}

fn join_entry(name: &OsStr, value: &OsStr) -> OsString {
    let mut entry = OsString::with_capacity(name.len() + 1 + value.len());
    entry.push(name);
    entry.push("=");
    entry.push(value);
    entry
}

/// Merge `base` with `overrides` and the fixed variables
pub fn merge_environment<I>(base: I, overrides: &[OsString], cwd: Option<&Path>) -> Vec<OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut vars: BTreeMap<OsString, Option<OsString>> = BTreeMap::new();
    for (name, value) in base {
        vars.insert(name, Some(value));
    }

    vars.insert("TERM".into(), Some(TERM_DEFAULT.into()));

    for entry in overrides {
        let (name, value) = split_entry(entry);
        vars.insert(name, value);
    }

    vars.insert(VERSION_VAR.into(), Some(version_number().to_string().into()));
    vars.insert("COLORTERM".into(), Some(COLORTERM_VALUE.into()));

    if let Some(cwd) = cwd {
        vars.insert("PWD".into(), Some(cwd.as_os_str().to_os_string()));
    }

    vars.iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| join_entry(name, v)))
        .collect()
}

/// Build a child environment, reading the parent's if `inherit` is set
pub fn prepare_environment(inherit: bool, overrides: &[OsString], cwd: Option<&Path>) -> Vec<OsString> {
    let base: Vec<(OsString, OsString)> = if inherit {
        std::env::vars_os().collect()
    } else {
        Vec::new()
    };
    merge_environment(base, overrides, cwd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    fn lookup<'a>(env: &'a [OsString], name: &str) -> Option<&'a str> {
        let prefix = format!("{}=", name);
        env.iter()
            .filter_map(|e| e.to_str())
            .find_map(|e| e.strip_prefix(prefix.as_str()))
    }

    #[test]
    fn test_term_default_and_fixed_vars() {
        let env = merge_environment(Vec::new(), &[], None);
        assert_eq!(lookup(&env, "TERM"), Some(TERM_DEFAULT));
        assert_eq!(lookup(&env, "COLORTERM"), Some("truecolor"));
        assert_eq!(lookup(&env, VERSION_VAR), Some(version_number().to_string().as_str()));
        assert_eq!(lookup(&env, "PWD"), None);
    }

    #[test]
    fn test_caller_overrides_term_but_not_version() {
        let overrides = entries(&["TERM=vt100", "MOCHI_PTY_VERSION=1", "COLORTERM=no"]);
        let env = merge_environment(Vec::new(), &overrides, None);
        assert_eq!(lookup(&env, "TERM"), Some("vt100"));
        assert_eq!(lookup(&env, "COLORTERM"), Some("truecolor"));
        assert_ne!(lookup(&env, VERSION_VAR), Some("1"));
    }

    #[test]
    fn test_overrides_beat_parent_and_pwd_beats_all() {
        let base = vec![
            (OsString::from("HOME"), OsString::from("/home/a")),
            (OsString::from("PWD"), OsString::from("/old")),
            (OsString::from("TERM"), OsString::from("linux")),
        ];
        let overrides = entries(&["HOME=/home/b", "PWD=/caller"]);
        let env = merge_environment(base, &overrides, Some(Path::new("/work")));
        assert_eq!(lookup(&env, "HOME"), Some("/home/b"));
        assert_eq!(lookup(&env, "PWD"), Some("/work"));
        assert_eq!(lookup(&env, "TERM"), Some(TERM_DEFAULT));
    }

    #[test]
    fn test_entry_without_value_unsets() {
        let base = vec![(OsString::from("SECRET"), OsString::from("x"))];
        let env = merge_environment(base, &entries(&["SECRET"]), None);
        assert_eq!(lookup(&env, "SECRET"), None);
    }

    #[test]
    fn test_value_may_contain_equals() {
        let env = merge_environment(Vec::new(), &entries(&["OPTS=a=b"]), None);
        assert_eq!(lookup(&env, "OPTS"), Some("a=b"));
    }

    #[test]
    fn test_no_duplicate_names() {
        let overrides = entries(&["A=1", "A=2", "B=3"]);
        let env = merge_environment(Vec::new(), &overrides, None);
        assert_eq!(lookup(&env, "A"), Some("2"));
        assert_eq!(env.iter().filter(|e| e.to_str().unwrap().starts_with("A=")).count(), 1);
    }

    #[test]
    fn test_version_number() {
        assert_eq!(version_number(), 100);
    }
}
