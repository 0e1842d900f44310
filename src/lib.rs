//! Mochi PTY Library
//!
//! Pseudoterminal allocation and child spawning for the Mochi terminal.
//! This crate provides:
//!
//! - `pty`: PTY master allocation, window size, packet-mode I/O
//! - `child`: the code that runs between fork and exec
//! - `spawn`: spawn configuration, environment merging and the spawn operation
//! - `helper`: the privilege-separated PTY helper protocol (server and client)
//! - `config`: TOML configuration for the binaries
//!
//! This is Unix-specific and uses the POSIX PTY APIs.

pub mod child;
pub mod config;
pub mod error;
pub mod helper;
pub mod pty;
pub mod spawn;

pub use child::ExecStep;
pub use error::{HelperError, PtyError, SpawnError};
pub use pty::{Packet, Pty, PtyFlags, PtyHandle, WindowSize};
pub use spawn::{Cancellable, SpawnConfig, SpawnOperation, WaitPool};
