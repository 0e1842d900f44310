//! One fork+exec attempt, from report pipe to reaping
//!
//! ```text
//! new ──► prepare (fork) ──► run (wait on report pipe) ──► Ok(pid) / Err
//!                 │
//!                 └── dropped before the pid is handed out: SIGHUP, reap
//! ```
//!
//! `prepare` always runs on the calling thread. `run` only blocks on the
//! report pipe, so it may run anywhere; [`SpawnOperation::run_async`] moves it
//! onto a [`WaitPool`] worker.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpgid, read, ForkResult, Pid};

use super::{cloexec_pipe, Cancellable, ScopeManager, SpawnConfig, SystemdScope, WaitPool};
use crate::child::{self, ChildExec, ChildFailure, CHILD_EXIT_STATUS, REPORT_LEN};
use crate::error::SpawnError;

/// How long `run` waits for the child to exec or report
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of `WNOHANG` polls before an abandoned child gets SIGKILL
const REAP_ATTEMPTS: u32 = 10;
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Who receives SIGHUP when an unreleased child is abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillTarget {
    Group(Pid),
    Process(Pid),
}

/// Decide whether an abandoned child can be killed by process group
///
/// The group is only used when both lookups succeeded and the child's group
/// differs from ours. A child that has not reached `setsid` yet still shares
/// our group; that race is accepted and falls back to the bare pid.
pub fn abandon_target(pid: Pid, child_pgrp: Result<Pid, Errno>, own_pgrp: Result<Pid, Errno>) -> KillTarget {
    match (child_pgrp, own_pgrp) {
        (Ok(child), Ok(own)) if child != own && child.as_raw() > 1 => KillTarget::Group(child),
        _ => KillTarget::Process(pid),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unprepared,
    Forked,
    Succeeded,
    Failed,
}

/// Spawn one program on a PTY
#[derive(Debug)]
pub struct SpawnOperation {
    config: SpawnConfig,
    timeout: Option<Duration>,
    cancellable: Option<Cancellable>,
    scope_manager: Arc<dyn ScopeManager>,
    state: State,
    pid: Option<Pid>,
    kill_pid: bool,
    report: Option<OwnedFd>,
}

impl SpawnOperation {
    /// Validate `config` and build its final environment
    pub fn new(mut config: SpawnConfig) -> Result<Self, SpawnError> {
        config.validate()?;
        config.prepare_environment();
        Ok(SpawnOperation {
            config,
            timeout: Some(DEFAULT_TIMEOUT),
            cancellable: None,
            scope_manager: Arc::new(SystemdScope::default()),
            state: State::Unprepared,
            pid: None,
            kill_pid: false,
            report: None,
        })
    }

    /// Bound the wait in `run`; `None` waits forever
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancellable(mut self, cancellable: Cancellable) -> Self {
        self.cancellable = Some(cancellable);
        self
    }

    /// Replace the default systemd scope backend
    pub fn scope_manager(mut self, manager: Arc<dyn ScopeManager>) -> Self {
        self.scope_manager = manager;
        self
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// The child's pid while this operation still owns it
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Take ownership of the child; it will no longer be killed on drop
    pub fn release_pid(&mut self) -> Option<Pid> {
        self.kill_pid = false;
        self.pid.take()
    }

    /// Create the report pipe and fork
    ///
    /// Must be called from the thread that owns the operation, never from a
    /// pool worker.
    pub fn prepare(&mut self) -> Result<(), SpawnError> {
        if self.state != State::Unprepared {
            return Err(SpawnError::InvalidState("prepare called twice"));
        }
        if self.config.scope && self.config.require_scope && !self.scope_manager.is_available() {
            self.state = State::Failed;
            return Err(SpawnError::ScopeUnavailable);
        }

        let (read_end, write_end) = cloexec_pipe().map_err(SpawnError::Pipe)?;
        let mut report_fd = write_end.as_raw_fd();
        let arg0 = self.config.arg0();

        let mut exec = ChildExec::new(&mut self.config, report_fd)?;
        tracing::debug!(arg0 = %arg0, strings = exec.string_count(), "Forking child");

        // SAFETY: the child only runs the prepared plan and then exits
        match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe {
                drop(read_end);
                let failure = exec.run(&mut report_fd);
                child::write_report(report_fd, failure);
                libc::_exit(CHILD_EXIT_STATUS);
            },
            Ok(ForkResult::Parent { child }) => {
                drop(exec);
                drop(write_end);
                tracing::debug!(pid = %child, arg0 = %arg0, "Forked child");
                self.pid = Some(child);
                self.kill_pid = true;
                self.report = Some(read_end);
                self.state = State::Forked;
                Ok(())
            },
            Err(errno) => {
                self.state = State::Failed;
                Err(SpawnError::Fork(errno))
            },
        }
    }

    /// Wait for the child to exec, then hand its pid to the caller
    pub fn run(&mut self) -> Result<Pid, SpawnError> {
        if self.state != State::Forked {
            return Err(SpawnError::InvalidState("run requires a prepared operation"));
        }
        let pid = self
            .pid
            .ok_or(SpawnError::InvalidState("child pid was already released"))?;

        match self.wait_for_report() {
            Ok(None) => {},
            Ok(Some(failure)) => {
                // The child exits on its own after reporting
                self.kill_pid = false;
                self.state = State::Failed;
                let err = SpawnError::from_child_report(
                    failure.step,
                    failure.errno,
                    &self.config.arg0(),
                    self.config.cwd.as_ref(),
                );
                tracing::debug!(%pid, "Child failed before exec: {}", err);
                return Err(err);
            },
            Err(e) => {
                self.state = State::Failed;
                return Err(e);
            },
        }

        tracing::debug!(%pid, "Child exec succeeded");

        if self.config.scope {
            if let Err(source) = self.scope_manager.attach(pid) {
                if self.config.require_scope {
                    self.state = State::Failed;
                    return Err(SpawnError::Scope {
                        pid: pid.as_raw(),
                        source,
                    });
                }
                tracing::debug!(%pid, "Not moving child into a scope: {}", source);
            }
        }

        self.state = State::Succeeded;
        self.kill_pid = false;
        self.pid = None;
        Ok(pid)
    }

    /// `prepare` then `run` on the calling thread
    pub fn run_sync(mut self) -> Result<Pid, SpawnError> {
        self.prepare()?;
        self.run()
    }

    /// `prepare` on the calling thread, `run` on a pool worker
    ///
    /// `callback` is invoked exactly once, on a worker thread.
    pub fn run_async<F>(mut self, pool: &WaitPool, callback: F)
    where
        F: FnOnce(Result<Pid, SpawnError>) + Send + 'static,
    {
        if let Err(e) = self.prepare() {
            pool.execute(move || callback(Err(e)));
            return;
        }
        pool.execute(move || {
            let result = self.run();
            drop(self);
            callback(result);
        });
    }

    /// Read the report pipe until EOF (exec succeeded) or a full record
    fn wait_for_report(&mut self) -> Result<Option<ChildFailure>, SpawnError> {
        let report = self
            .report
            .take()
            .ok_or(SpawnError::InvalidState("report pipe already consumed"))?;
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut buf = [0u8; REPORT_LEN];
        let mut filled = 0;

        loop {
            if self.cancellable.as_ref().is_some_and(Cancellable::is_cancelled) {
                return Err(SpawnError::Cancelled);
            }

            let timeout = match deadline {
                None => PollTimeout::NONE,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(SpawnError::TimedOut);
                    }
                    let ms = remaining.as_millis().clamp(1, u128::from(u16::MAX)) as u16;
                    PollTimeout::from(ms)
                },
            };

            let mut fds = vec![PollFd::new(report.as_fd(), PollFlags::POLLIN)];
            if let Some(cancellable) = &self.cancellable {
                fds.push(PollFd::new(cancellable.poll_fd(), PollFlags::POLLIN));
            }

            match poll(&mut fds, timeout) {
                Ok(0) => continue,
                Ok(_) => {},
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SpawnError::Poll(e)),
            }

            let ready = |fd: &PollFd<'_>| {
                fd.revents()
                    .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
            };
            let report_ready = ready(&fds[0]);
            let cancelled = fds.get(1).is_some_and(ready);
            drop(fds);

            if report_ready {
                match read(report.as_raw_fd(), &mut buf[filled..]) {
                    Ok(0) if filled == 0 => return Ok(None),
                    Ok(0) => return Err(SpawnError::ReadPipe(Errno::EIO)),
                    Ok(n) => {
                        filled += n;
                        if filled == REPORT_LEN {
                            return Ok(Some(ChildFailure::decode(&buf)));
                        }
                    },
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => {},
                    Err(e) => return Err(SpawnError::ReadPipe(e)),
                }
            } else if cancelled {
                return Err(SpawnError::Cancelled);
            }
        }
    }
}

fn reap(pid: Pid) -> Option<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(status) => return Some(status),
            Err(_) => return None,
        }
    }
}

/// Reap a child that was just sent SIGHUP, escalating if it lingers
fn reap_abandoned(pid: Pid) -> Option<WaitStatus> {
    let mut attempts = 0;
    while attempts < REAP_ATTEMPTS {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                attempts += 1;
                thread::sleep(REAP_INTERVAL);
            },
            Err(Errno::EINTR) => {},
            Ok(status) => return Some(status),
            Err(_) => return None,
        }
    }
    tracing::warn!(%pid, "Abandoned child ignored SIGHUP, sending SIGKILL");
    let _ = kill(pid, Signal::SIGKILL);
    reap(pid)
}

impl SpawnOperation {
    /// Give up on the child: SIGHUP it unless it was released or failed on
    /// its own, then reap it
    ///
    /// Returns how the child ended, or `None` if there was no child to reap.
    /// Dropping the operation does the same and discards the status.
    pub fn abandon(mut self) -> Option<WaitStatus> {
        self.dispose()
    }

    fn dispose(&mut self) -> Option<WaitStatus> {
        let pid = self.pid.take()?;
        // Close our end first so a child still writing its report cannot block
        self.report.take();

        if !self.kill_pid {
            return reap(pid);
        }

        let target = abandon_target(pid, getpgid(Some(pid)), getpgid(None));
        tracing::debug!(%pid, ?target, "Killing abandoned child");
        if let KillTarget::Group(pgrp) = target {
            let _ = killpg(pgrp, Signal::SIGHUP);
        }
        let _ = kill(pid, Signal::SIGHUP);
        let status = reap_abandoned(pid);
        tracing::debug!(%pid, ?status, "Reaped abandoned child");
        status
    }
}

impl Drop for SpawnOperation {
    fn drop(&mut self) {
        self.dispose();
    }
}
