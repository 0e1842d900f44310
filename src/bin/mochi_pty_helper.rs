//! Mochi PTY helper
//!
//! Installed setuid. Serves one client: requests arrive on fd 0, PTY
//! descriptors leave on fd 1. Exits when the client closes the channel
//! or on SIGHUP/SIGTERM, writing logout records for anything still open.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use mochi_pty::config::{Config, HELPER_CONFIG_PATH};
use mochi_pty::helper::hygiene::{install_shutdown_handlers, sanitize_process, shutdown_flag};
use mochi_pty::helper::{Accounting, HelperSession, Identity, PrivilegedAllocator, RecordingAccounting, SystemAccounting};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mochi-pty-helper")]
#[command(version)]
#[command(about = "Allocate PTYs and record logins for an unprivileged client", long_about = None)]
struct HelperArgs {
    /// Log accounting entries instead of writing the system databases
    #[arg(long)]
    dry_run: bool,
}

fn serve<A: Accounting>(identity: Identity, accounting: A, tty_group: &str, wakeup: BorrowedFd<'_>) -> ExitCode {
    // SAFETY: sanitize_process checked both descriptors; nothing else owns them
    let (control, fdpass) = unsafe {
        (
            OwnedFd::from_raw_fd(libc::STDIN_FILENO),
            OwnedFd::from_raw_fd(libc::STDOUT_FILENO),
        )
    };

    let mut session = HelperSession::new(control, fdpass, identity, accounting, PrivilegedAllocator::new(tty_group));
    match session.serve(shutdown_flag(), Some(wakeup)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Helper stopped: {}", e);
            ExitCode::FAILURE
        },
    }
}

fn main() -> ExitCode {
    // Runs before anything can open descriptors of its own
    if let Err(e) = sanitize_process() {
        eprintln!("mochi-pty-helper: refusing to start: {}", e);
        return ExitCode::FAILURE;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = HelperArgs::parse();
    let config = Config::load_system(Path::new(HELPER_CONFIG_PATH));

    let wakeup = match install_shutdown_handlers() {
        Ok(wakeup) => wakeup,
        Err(e) => {
            tracing::error!("Failed to install signal handlers: {}", e);
            return ExitCode::FAILURE;
        },
    };

    let identity = Identity::resolve();
    tracing::debug!(user = %identity.login_name, uid = identity.uid.as_raw(), "Serving PTY requests");

    let settings = config.helper;
    if args.dry_run {
        let accounting = RecordingAccounting::new();
        let code = serve(identity, accounting.clone(), &settings.tty_group, wakeup.as_fd());
        for (database, entry) in accounting.entries() {
            tracing::info!(?database, kind = ?entry.kind, line = %entry.line, user = %entry.user, "Accounting entry");
        }
        code
    } else {
        let accounting = SystemAccounting::new(settings.wtmp_path, settings.lastlog_path);
        serve(identity, accounting, &settings.tty_group, wakeup.as_fd())
    }
}
