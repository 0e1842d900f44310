//! mochi-spawn - run a command in a new PTY and relay its I/O
//!
//! Exercises the whole spawn path from the command line: configuration,
//! PTY allocation (directly or through the helper), the spawn operation,
//! and packet-mode reads.

use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{isatty, read, Pid};

use mochi_pty::config::{CliArgs, Config};
use mochi_pty::helper::{HelperClient, Token};
use mochi_pty::spawn::NoScope;
use mochi_pty::{Packet, Pty, PtyError, PtyFlags, SpawnConfig, SpawnOperation, WindowSize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Restores the original stdin settings on drop
struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    fn new() -> nix::Result<Self> {
        let original = termios::tcgetattr(io::stdin())?;
        let mut raw = original.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG | LocalFlags::IEXTEN);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw)?;
        Ok(RawModeGuard { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original);
    }
}

/// Where the PTY came from
enum Allocation {
    Direct,
    /// The peer stays open until the child has it, then must be closed so
    /// the master reports EIO once the child is gone
    Helper {
        client: HelperClient,
        token: Token,
        peer: Option<OwnedFd>,
    },
}

impl Allocation {
    fn release_peer(&mut self) {
        if let Allocation::Helper { peer, .. } = self {
            peer.take();
        }
    }
}

fn allocate(config: &Config, use_helper: bool) -> Result<(Pty, Allocation), String> {
    if !use_helper {
        let pty = Pty::create(PtyFlags::no_accounting()).map_err(|e| e.to_string())?;
        return Ok((pty, Allocation::Direct));
    }
    let mut client = HelperClient::launch(&config.helper.helper_path).map_err(|e| e.to_string())?;
    let (pty, peer, token) = client.open_pty(PtyFlags::default()).map_err(|e| e.to_string())?;
    Ok((
        pty,
        Allocation::Helper {
            client,
            token,
            peer: Some(peer),
        },
    ))
}

fn default_command() -> Vec<String> {
    vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())]
}

/// The size of the terminal we run in, if any
fn terminal_size() -> WindowSize {
    // SAFETY: winsize is plain data; TIOCGWINSZ fills it in
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 {
        WindowSize::from_winsize(ws).or_default_cells()
    } else {
        WindowSize::new(0, 0).or_default_cells()
    }
}

fn wait_for_exit(pid: Pid) -> u8 {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return code as u8,
            Ok(WaitStatus::Signaled(_, signal, _)) => return 128u8.wrapping_add(signal as i32 as u8),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return 0,
            Err(e) => {
                tracing::warn!("waitpid failed: {}", e);
                return 1;
            },
        }
    }
}

/// Copy stdin to the master and master output to stdout until the child
/// goes away
fn relay(pty: &Pty) -> io::Result<()> {
    let mut stdout = io::stdout();
    let mut buf = [0u8; 4096];
    let mut stdin_open = true;

    loop {
        let stdin = io::stdin();
        let mut fds = vec![PollFd::new(pty.as_fd(), PollFlags::POLLIN)];
        if stdin_open {
            fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLIN));
        }
        match poll(&mut fds, PollTimeout::from(100u16)) {
            Ok(_) | Err(Errno::EINTR) => {},
            Err(e) => return Err(e.into()),
        }
        let hangup = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let master_ready = fds[0].revents().is_some_and(|r| r.intersects(hangup));
        let stdin_ready = fds.get(1).and_then(|fd| fd.revents()).is_some_and(|r| r.intersects(hangup));
        drop(fds);

        if master_ready {
            match pty.read_packet(&mut buf) {
                Ok(Packet::Data(0)) | Err(PtyError::Read(Errno::EIO)) => return Ok(()),
                Ok(Packet::Data(n)) => {
                    stdout.write_all(&buf[..n])?;
                    stdout.flush()?;
                },
                Ok(Packet::Control(status)) => tracing::trace!(status, "PTY status packet"),
                Ok(Packet::WouldBlock) => {},
                Err(e) => return Err(io::Error::other(e)),
            }
        }

        if stdin_ready {
            match read(stdin.as_raw_fd(), &mut buf) {
                Ok(0) => stdin_open = false,
                Ok(n) => pty.write_all(&buf[..n]).map_err(io::Error::other)?,
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {},
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = CliArgs::parse();
    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mochi-spawn: {}", e);
            return ExitCode::FAILURE;
        },
    };

    let (pty, mut allocation) = match allocate(&config, args.use_helper) {
        Ok(allocated) => allocated,
        Err(e) => {
            eprintln!("mochi-spawn: failed to allocate a PTY: {}", e);
            return ExitCode::FAILURE;
        },
    };

    let current = terminal_size();
    let size = WindowSize::new(
        args.rows.unwrap_or(current.rows),
        args.columns.unwrap_or(current.cols),
    );
    if let Err(e) = pty.set_size(size) {
        tracing::warn!("Failed to set window size: {}", e);
    }

    let pty = Arc::new(pty);
    let command = if args.command.is_empty() {
        default_command()
    } else {
        args.command.clone()
    };

    let settings = &config.spawn;
    let mut spawn_config = SpawnConfig::new(Arc::clone(&pty), &command)
        .envs(&args.env)
        .inherit_environment(settings.inherit_environment)
        .search_path(settings.search_path)
        .scope(settings.systemd_scope)
        .require_scope(settings.require_systemd_scope);
    if let Some(dir) = &args.cwd {
        spawn_config = spawn_config.current_dir(dir);
    }
    if let Some(dir) = &settings.fallback_directory {
        spawn_config = spawn_config.fallback_dir(dir);
    }

    let operation = match SpawnOperation::new(spawn_config) {
        Ok(operation) => operation.timeout(settings.timeout()),
        Err(e) => {
            eprintln!("mochi-spawn: {}", e);
            return ExitCode::FAILURE;
        },
    };
    let operation = if settings.systemd_scope {
        operation
    } else {
        operation.scope_manager(Arc::new(NoScope))
    };

    let spawned = operation.run_sync();
    allocation.release_peer();
    let pid = match spawned {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("mochi-spawn: {}", e);
            return ExitCode::from(127);
        },
    };
    tracing::info!(pid = pid.as_raw(), "Started {:?}", command);

    let result = {
        let _raw = if isatty(io::stdin().as_raw_fd()).unwrap_or(false) {
            RawModeGuard::new().ok()
        } else {
            None
        };
        relay(&pty)
    };
    if let Err(e) = result {
        tracing::error!("Relay failed: {}", e);
    }

    if let Allocation::Helper { mut client, token, .. } = allocation {
        if let Err(e) = client.close(token) {
            tracing::warn!("Failed to release PTY: {}", e);
        }
    }

    ExitCode::from(wait_for_exit(pid))
}
