//! Descriptor passing over a Unix socket
//!
//! Each call carries exactly one descriptor as `SCM_RIGHTS` data along with a
//! single filler byte.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::error::HelperError;
use crate::pty::set_cloexec;

/// Send `fd` over `socket`
pub fn send_fd(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<(), HelperError> {
    let filler = [0u8; 1];
    let iov = [IoSlice::new(&filler)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    loop {
        match sendmsg::<UnixAddr>(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE) => return Err(HelperError::Disconnected),
            Err(e) => return Err(HelperError::Io(e)),
        }
    }
}

/// Receive one descriptor from `socket`; it is returned close-on-exec
pub fn recv_fd(socket: BorrowedFd<'_>) -> Result<OwnedFd, HelperError> {
    let mut filler = [0u8; 1];
    let mut space = nix::cmsg_space!(RawFd);

    loop {
        let mut iov = [IoSliceMut::new(&mut filler)];
        let msg = match recvmsg::<UnixAddr>(socket.as_raw_fd(), &mut iov, Some(&mut space), MsgFlags::empty()) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(HelperError::Io(e)),
        };
        if msg.bytes == 0 {
            return Err(HelperError::Disconnected);
        }

        let mut received: Vec<RawFd> = Vec::new();
        for cmsg in msg.cmsgs().map_err(HelperError::Io)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received.extend(fds);
            }
        }

        // SAFETY: SCM_RIGHTS installed these descriptors in our table
        let mut owned = received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
        let fd = owned.next().ok_or(HelperError::MissingDescriptor)?;
        drop(owned);
        set_cloexec(fd.as_raw_fd()).map_err(HelperError::Io)?;
        return Ok(fd);
    }
}
