//! Cooperative cancellation for blocking waits
//!
//! A [`Cancellable`] is a self-pipe: cancelling writes a byte, so any
//! thread blocked in `poll` on the read end wakes up.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::unistd::write;

use super::cloexec_pipe;
use crate::pty::set_nonblocking;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    read: OwnedFd,
    write: OwnedFd,
}

/// A cancellation token shared between the waiter and whoever cancels
#[derive(Debug, Clone)]
pub struct Cancellable {
    inner: Arc<Inner>,
}

impl Cancellable {
    pub fn new() -> Result<Self, Errno> {
        let (read, write) = cloexec_pipe()?;
        set_nonblocking(read.as_raw_fd())?;
        set_nonblocking(write.as_raw_fd())?;
        Ok(Cancellable {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                read,
                write,
            }),
        })
    }

    /// Cancel and wake every waiter; repeated calls do nothing
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            if let Err(e) = write(&self.inner.write, &[1]) {
                tracing::debug!("Failed to signal cancellation pipe: {}", e);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Descriptor that becomes readable once cancelled
    pub(crate) fn poll_fd(&self) -> BorrowedFd<'_> {
        self.inner.read.as_fd()
    }
}
