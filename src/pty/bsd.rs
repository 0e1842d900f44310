//! BSD and macOS PTY driver
//!
//! These kernels have no way to derive the peer from the master without a
//! path lookup, and opening the peer never makes it the controlling
//! terminal, so the trait defaults (open by name, then `TIOCSCTTY`) apply.

use super::platform::PtyPlatform;

/// The BSD-family terminal driver
pub struct Bsd;

impl PtyPlatform for Bsd {}
