//! Privilege-separated PTY allocation
//!
//! The helper is a setuid process serving one client over two descriptors:
//! fd 0 carries requests and replies, fd 1 carries the PTY descriptors as
//! `SCM_RIGHTS` messages. It allocates with the user's credentials, gives
//! the peer to the user and keeps utmp, wtmp and lastlog in step with the
//! PTYs it handed out.

pub mod accounting;
pub mod client;
pub mod fdpass;
pub mod hygiene;
pub mod protocol;
pub mod session;

pub use accounting::{Accounting, EntryKind, RecordingAccounting, SystemAccounting, UtmpEntry};
pub use client::{HelperClient, OpenedPty};
pub use fdpass::{recv_fd, send_fd};
pub use protocol::{Database, Databases, Opcode, Token};
pub use session::{AllocatedPty, HelperSession, Identity, PrivilegedAllocator, PtyAllocator, PtyRecord, Step};
