//! Talking to the helper from the unprivileged side

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use nix::sys::socket::{shutdown, socketpair, AddressFamily, Shutdown, SockFlag, SockType};

use super::fdpass::recv_fd;
use super::protocol::{read_exact, read_int, read_token, write_int, write_token, Databases, Opcode, Token};
use crate::error::HelperError;
use crate::pty::{set_cloexec, Pty, PtyFlags};

/// A PTY pair the helper opened for us
#[derive(Debug)]
pub struct OpenedPty {
    pub master: OwnedFd,
    pub peer: OwnedFd,
    /// Pass to [`HelperClient::close`] to write the logout records
    pub token: Token,
}

fn channel() -> Result<(OwnedFd, OwnedFd), HelperError> {
    let (ours, theirs) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
        .map_err(HelperError::Io)?;
    set_cloexec(ours.as_raw_fd()).map_err(HelperError::Io)?;
    set_cloexec(theirs.as_raw_fd()).map_err(HelperError::Io)?;
    Ok((ours, theirs))
}

/// Client end of a helper connection
#[derive(Debug)]
pub struct HelperClient {
    control: OwnedFd,
    fdpass: OwnedFd,
    child: Option<Child>,
}

impl HelperClient {
    /// Start the helper binary at `path` with its channels on fds 0 and 1
    pub fn launch(path: &Path) -> Result<Self, HelperError> {
        let (control, helper_control) = channel()?;
        let (fdpass, helper_fdpass) = channel()?;

        let child = Command::new(path)
            .stdin(Stdio::from(helper_control))
            .stdout(Stdio::from(helper_fdpass))
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| HelperError::Launch {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::debug!(pid = child.id(), "Started PTY helper {:?}", path);
        Ok(HelperClient {
            control,
            fdpass,
            child: Some(child),
        })
    }

    /// Use channels to a helper that is already running
    pub fn from_fds(control: OwnedFd, fdpass: OwnedFd) -> Self {
        HelperClient {
            control,
            fdpass,
            child: None,
        }
    }

    /// Ask for a PTY recorded in `databases`
    pub fn open(&mut self, databases: Databases) -> Result<OpenedPty, HelperError> {
        write_int(self.control.as_fd(), Opcode::open_for(databases) as i32)?;
        if read_int(self.control.as_fd())? == 0 {
            return Err(HelperError::OpenFailed);
        }
        let token = read_token(self.control.as_fd())?;
        let master = recv_fd(self.fdpass.as_fd())?;
        let peer = recv_fd(self.fdpass.as_fd())?;
        Ok(OpenedPty { master, peer, token })
    }

    /// Open a PTY and adopt its master; accounting follows `flags`
    pub fn open_pty(&mut self, flags: PtyFlags) -> Result<(Pty, OwnedFd, Token), HelperError> {
        let opened = self.open(Databases::from_flags(flags))?;
        let pty = Pty::create_foreign(opened.master, flags)?;
        Ok((pty, opened.peer, opened.token))
    }

    /// Release a PTY; the helper writes its logout records
    pub fn close(&mut self, token: Token) -> Result<(), HelperError> {
        write_int(self.control.as_fd(), Opcode::Close as i32)?;
        write_token(self.control.as_fd(), token)
    }

    /// Wait until the helper has handled every earlier request
    pub fn synch(&mut self) -> Result<(), HelperError> {
        write_int(self.control.as_fd(), Opcode::Synch as i32)?;
        let mut ack = [0u8; 1];
        read_exact(self.control.as_fd(), &mut ack)
    }

    pub fn reset(&mut self) -> Result<(), HelperError> {
        write_int(self.control.as_fd(), Opcode::ResetToDefaults as i32)
    }
}

impl Drop for HelperClient {
    fn drop(&mut self) {
        // EOF on the control channel makes the helper flush and exit
        let _ = shutdown(self.control.as_raw_fd(), Shutdown::Both);
        let _ = shutdown(self.fdpass.as_raw_fd(), Shutdown::Both);
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => tracing::debug!("PTY helper exited with {}", status),
                Err(e) => tracing::warn!("Failed to wait for PTY helper: {}", e),
            }
        }
    }
}
