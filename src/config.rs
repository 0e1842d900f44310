//! Configuration for the Mochi PTY tools
//!
//! `mochi-spawn` resolves its settings with the precedence
//! CLI > environment > config file > defaults. The helper binary only reads
//! the fixed system file at [`HELPER_CONFIG_PATH`].

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration read by the privileged helper
pub const HELPER_CONFIG_PATH: &str = "/etc/mochi/pty-helper.toml";

/// Upper bound for the async wait pool
pub const MAX_WORKERS: usize = 64;

/// CLI arguments for mochi-spawn
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mochi-spawn")]
#[command(author = "Mochi Team")]
#[command(version)]
#[command(about = "Run a command inside a fresh pseudoterminal", long_about = None)]
pub struct CliArgs {
    /// Path to custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Milliseconds to wait for the child to exec (0 waits forever)
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Do not move the child into a systemd scope
    #[arg(long)]
    pub no_scope: bool,

    /// Fail if the child cannot be moved into a systemd scope
    #[arg(long)]
    pub require_scope: bool,

    /// Execute the command as given, without a PATH lookup
    #[arg(long)]
    pub no_search_path: bool,

    /// Start the child with an empty environment
    #[arg(long)]
    pub clean_env: bool,

    /// Working directory for the child
    #[arg(short = 'C', long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Directory to use if the working directory is inaccessible
    #[arg(long, value_name = "DIR")]
    pub fallback_dir: Option<PathBuf>,

    /// Extra environment entry (NAME=VALUE, or NAME to unset)
    #[arg(short, long = "env", value_name = "ENTRY")]
    pub env: Vec<String>,

    /// Initial rows
    #[arg(long, value_name = "ROWS")]
    pub rows: Option<u16>,

    /// Initial columns
    #[arg(long, value_name = "COLS")]
    pub columns: Option<u16>,

    /// Allocate the PTY through the privileged helper and record the login
    #[arg(long)]
    pub use_helper: bool,

    /// Command and arguments (defaults to $SHELL)
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Settings for spawning children
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSettings {
    /// Milliseconds to wait for exec; 0 disables the timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Move each child into its own systemd scope
    #[serde(default = "default_true")]
    pub systemd_scope: bool,
    /// Treat a failed scope move as a spawn failure
    #[serde(default)]
    pub require_systemd_scope: bool,
    /// Look commands up in PATH
    #[serde(default = "default_true")]
    pub search_path: bool,
    /// Start from the parent environment
    #[serde(default = "default_true")]
    pub inherit_environment: bool,
    /// Directory to fall back to when the working directory is inaccessible
    #[serde(default)]
    pub fallback_directory: Option<PathBuf>,
    /// Worker threads for asynchronous spawns
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_workers() -> usize {
    2
}

impl Default for SpawnSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            systemd_scope: true,
            require_systemd_scope: false,
            search_path: true,
            inherit_environment: true,
            fallback_directory: None,
            workers: default_workers(),
        }
    }
}

impl SpawnSettings {
    /// The exec timeout, or `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Settings for the privileged PTY helper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperSettings {
    /// Where clients find the helper binary
    #[serde(default = "default_helper_path")]
    pub helper_path: PathBuf,
    #[serde(default = "default_wtmp_path")]
    pub wtmp_path: PathBuf,
    #[serde(default = "default_lastlog_path")]
    pub lastlog_path: PathBuf,
    /// Group that owns allocated terminals
    #[serde(default = "default_tty_group")]
    pub tty_group: String,
}

fn default_helper_path() -> PathBuf {
    PathBuf::from("/usr/libexec/mochi-pty-helper")
}
fn default_wtmp_path() -> PathBuf {
    PathBuf::from("/var/log/wtmp")
}
fn default_lastlog_path() -> PathBuf {
    PathBuf::from("/var/log/lastlog")
}
fn default_tty_group() -> String {
    "tty".to_string()
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            helper_path: default_helper_path(),
            wtmp_path: default_wtmp_path(),
            lastlog_path: default_lastlog_path(),
            tty_group: default_tty_group(),
        }
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub spawn: SpawnSettings,
    #[serde(default)]
    pub helper: HelperSettings,
}

/// Configuration error
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        let config_path = args.config.clone().or_else(Self::default_config_path);
        if let Some(path) = &config_path {
            if path.exists() {
                match Self::load_from_file(path) {
                    Ok(file_config) => config = file_config,
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    },
                }
            }
        }

        config.apply_env_vars();
        config.apply_cli_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Load the helper's system configuration; never reads the environment
    pub fn load_system(path: &Path) -> Self {
        if !path.exists() {
            return Config::default();
        }
        match Self::load_from_file(path).and_then(|c| c.validate().map(|()| c)) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring {:?}: {}", path, e);
                Config::default()
            },
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("Failed to read config file: {}", e),
            field: None,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError {
            message: format!("Failed to parse config file: {}", e),
            field: None,
        })
    }

    fn apply_env_vars(&mut self) {
        self.apply_env(|name| env::var(name).ok());
    }

    /// Apply environment overrides read through `lookup`
    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(val) = lookup("MOCHI_SPAWN_TIMEOUT") {
            if let Ok(ms) = val.parse() {
                self.spawn.timeout_ms = ms;
            }
        }
        if let Some(flag) = lookup("MOCHI_SPAWN_SCOPE").as_deref().and_then(parse_flag) {
            self.spawn.systemd_scope = flag;
        }
        if let Some(flag) = lookup("MOCHI_SPAWN_REQUIRE_SCOPE")
            .as_deref()
            .and_then(parse_flag)
        {
            self.spawn.require_systemd_scope = flag;
        }
        if let Some(path) = lookup("MOCHI_PTY_HELPER") {
            self.helper.helper_path = PathBuf::from(path);
        }
    }

    fn apply_cli_args(&mut self, args: &CliArgs) {
        if let Some(ms) = args.timeout_ms {
            self.spawn.timeout_ms = ms;
        }
        if args.no_scope {
            self.spawn.systemd_scope = false;
        }
        if args.require_scope {
            self.spawn.systemd_scope = true;
            self.spawn.require_systemd_scope = true;
        }
        if args.no_search_path {
            self.spawn.search_path = false;
        }
        if args.clean_env {
            self.spawn.inherit_environment = false;
        }
        if let Some(dir) = &args.fallback_dir {
            self.spawn.fallback_directory = Some(dir.clone());
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spawn.workers == 0 || self.spawn.workers > MAX_WORKERS {
            return Err(ConfigError {
                message: format!("Workers must be between 1 and {}", MAX_WORKERS),
                field: Some("spawn.workers".to_string()),
            });
        }
        if self.spawn.require_systemd_scope && !self.spawn.systemd_scope {
            return Err(ConfigError {
                message: "A required scope cannot be disabled".to_string(),
                field: Some("spawn.require_systemd_scope".to_string()),
            });
        }
        if let Some(dir) = &self.spawn.fallback_directory {
            Self::require_absolute(dir, "spawn.fallback_directory")?;
        }

        Self::require_absolute(&self.helper.helper_path, "helper.helper_path")?;
        Self::require_absolute(&self.helper.wtmp_path, "helper.wtmp_path")?;
        Self::require_absolute(&self.helper.lastlog_path, "helper.lastlog_path")?;
        if self.helper.tty_group.trim().is_empty() {
            return Err(ConfigError {
                message: "Terminal group must not be empty".to_string(),
                field: Some("helper.tty_group".to_string()),
            });
        }

        Ok(())
    }

    fn require_absolute(path: &Path, field: &str) -> Result<(), ConfigError> {
        if !path.is_absolute() {
            return Err(ConfigError {
                message: format!("Path {:?} must be absolute", path),
                field: Some(field.to_string()),
            });
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mochi").join("pty.toml"))
    }
}
