//! Error types for PTY, spawn and helper operations.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::child::ExecStep;
use crate::spawn::ScopeError;

/// Error type for PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] Errno),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] Errno),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] Errno),

    #[error("Invalid PTY descriptor: {0}")]
    InvalidDescriptor(#[source] Errno),

    #[error("Failed to set close-on-exec: {0}")]
    SetCloexec(#[source] Errno),

    #[error("Failed to set non-blocking mode: {0}")]
    SetNonBlocking(#[source] Errno),

    #[error("Failed to enable packet mode: {0}")]
    PacketMode(#[source] Errno),

    #[error("Failed to get PTY peer name: {0}")]
    PtsName(#[source] Errno),

    #[error("Failed to open PTY peer: {0}")]
    OpenPeer(#[source] Errno),

    #[error("Failed to get window size: {0}")]
    GetWindowSize(#[source] Errno),

    #[error("Failed to set window size: {0}")]
    SetWindowSize(#[source] Errno),

    #[error("Failed to change terminal attributes: {0}")]
    Termios(#[source] Errno),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] Errno),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] Errno),

    #[error("Failed to poll: {0}")]
    Poll(#[source] Errno),
}

impl PtyError {
    /// The OS error code that caused this failure
    pub fn errno(&self) -> Errno {
        match self {
            PtyError::OpenMaster(e)
            | PtyError::GrantPty(e)
            | PtyError::UnlockPty(e)
            | PtyError::InvalidDescriptor(e)
            | PtyError::SetCloexec(e)
            | PtyError::SetNonBlocking(e)
            | PtyError::PacketMode(e)
            | PtyError::PtsName(e)
            | PtyError::OpenPeer(e)
            | PtyError::GetWindowSize(e)
            | PtyError::SetWindowSize(e)
            | PtyError::Termios(e)
            | PtyError::Read(e)
            | PtyError::Write(e)
            | PtyError::Poll(e) => *e,
        }
    }
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Error type for spawning a child into a PTY
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Invalid spawn configuration: {0}")]
    InvalidConfig(String),

    #[error("Spawn operation used out of order: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] Errno),

    #[error("Failed to fork: {0}")]
    Fork(#[source] Errno),

    #[error("Failed to change to directory \"{}\": {errno}", .dir.display())]
    Chdir {
        arg0: String,
        dir: PathBuf,
        errno: Errno,
    },

    #[error("Failed to execute child process \"{arg0}\": {errno}")]
    Exec { arg0: String, errno: Errno },

    #[error("Failed to execute child process \"{arg0}\": {step} failed: {errno}")]
    ChildSetup {
        arg0: String,
        step: ExecStep,
        errno: Errno,
    },

    #[error("Operation timed out")]
    TimedOut,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Failed to poll child pipe: {0}")]
    Poll(#[source] Errno),

    #[error("Failed to read from child pipe: {0}")]
    ReadPipe(#[source] Errno),

    #[error("Failed to move child {pid} into a scope: {source}")]
    Scope {
        pid: i32,
        #[source]
        source: ScopeError,
    },

    #[error("A scope is required but no scope manager is available")]
    ScopeUnavailable,
}

impl SpawnError {
    /// The OS error code behind this failure, if there is one
    pub fn errno(&self) -> Option<Errno> {
        match self {
            SpawnError::Pty(e) => Some(e.errno()),
            SpawnError::Pipe(e)
            | SpawnError::Fork(e)
            | SpawnError::Poll(e)
            | SpawnError::ReadPipe(e) => Some(*e),
            SpawnError::Chdir { errno, .. }
            | SpawnError::Exec { errno, .. }
            | SpawnError::ChildSetup { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Translate a `{kind, errno}` record written by a failed child
    pub(crate) fn from_child_report(
        step: ExecStep,
        errno: Errno,
        arg0: &str,
        cwd: Option<&PathBuf>,
    ) -> Self {
        match (step, cwd) {
            (ExecStep::Chdir, Some(dir)) => SpawnError::Chdir {
                arg0: arg0.to_string(),
                dir: dir.clone(),
                errno,
            },
            (ExecStep::Exec, _) => SpawnError::Exec {
                arg0: arg0.to_string(),
                errno,
            },
            _ => SpawnError::ChildSetup {
                arg0: arg0.to_string(),
                step,
                errno,
            },
        }
    }
}

/// Error type for the PTY helper protocol
#[derive(Error, Debug)]
pub enum HelperError {
    #[error("Helper connection closed")]
    Disconnected,

    #[error("Helper I/O error: {0}")]
    Io(#[source] Errno),

    #[error("Helper failed to open a PTY")]
    OpenFailed,

    #[error("Helper reply did not carry a file descriptor")]
    MissingDescriptor,

    #[error("Failed to launch PTY helper {}: {source}", .path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to allocate PTY: {0}")]
    Allocate(#[source] Errno),

    #[error("Failed to switch credentials: {0}")]
    Credentials(#[source] Errno),

    #[error(transparent)]
    Pty(#[from] PtyError),
}
