//! Pseudo-terminal plumbing for console programs.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::sys::termios::{self, SetArg, Termios};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use super::ConsoleError;

/// Rows used when the local terminal size cannot be read.
pub const FALLBACK_ROWS: u16 = 120;

/// Columns used when the local terminal size cannot be read.
pub const FALLBACK_COLS: u16 = 400;

/// The master side of a pty, released by the cleanup chain.
pub(super) type SharedMaster = Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>;

/// A child process attached to a fresh pseudo-terminal.
pub(super) struct PtyProcess {
    pub master: SharedMaster,
    pub child: Box<dyn Child + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub pid: Option<u32>,
    pub tty: Option<PathBuf>,
}

/// Allocate a pty and spawn `args` with it as the controlling terminal.
pub(super) fn spawn(
    args: &[String],
    dir: &Path,
    env: &BTreeMap<String, String>,
) -> Result<PtyProcess, ConsoleError> {
    let pair = native_pty_system()
        .openpty(local_size())
        .map_err(|e| ConsoleError::resource("allocating pty", e))?;

    let mut cmd = CommandBuilder::from_argv(args.iter().map(OsString::from).collect());
    cmd.cwd(dir);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ConsoleError::resource("spawning console program", e))?;
    // The child holds its own copy of the slave side.
    drop(pair.slave);

    let pid = child.process_id();
    let tty = pair.master.tty_name();
    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            kill_now(pid);
            return Err(ConsoleError::resource("opening pty reader", e));
        }
    };

    Ok(PtyProcess {
        master: Arc::new(Mutex::new(Some(pair.master))),
        child,
        reader,
        pid,
        tty,
    })
}

/// Best-effort `SIGKILL` for a child that must not outlive a failed start.
pub(super) fn kill_now(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
}

/// Size of the local terminal, or 120 rows by 400 columns if it cannot be
/// read.
pub fn local_size() -> PtySize {
    let (rows, cols) = match crossterm::terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (rows, cols),
        Ok(_) | Err(_) => (FALLBACK_ROWS, FALLBACK_COLS),
    };
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Propagate the local terminal size to the pty. No-op once the pty is
/// closed.
pub(super) fn resize(master: &SharedMaster, label: &str) {
    let guard = master.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(master) = guard.as_ref() {
        let size = local_size();
        if let Err(e) = master.resize(size) {
            tracing::warn!(label = %label, error = %e, "Failed to resize pty");
        } else {
            tracing::trace!(label = %label, rows = size.rows, cols = size.cols, "Resized pty");
        }
    }
}

/// Relay `SIGWINCH` to the pty until `stop` is cancelled.
pub(super) fn spawn_resize_relay(
    master: SharedMaster,
    label: String,
    stop: CancellationToken,
) -> Result<(), ConsoleError> {
    let mut winch = signal(SignalKind::window_change())
        .map_err(|e| ConsoleError::resource("installing resize handler", e))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                received = winch.recv() => {
                    if received.is_none() {
                        break;
                    }
                    resize(&master, &label);
                }
            }
        }
        tracing::trace!(label = %label, "Resize relay stopped");
    });
    Ok(())
}

/// The console's terminal switched to raw mode, with the original settings
/// kept for restoring.
pub(super) struct RawMode {
    tty: File,
    original: Termios,
}

impl RawMode {
    /// Open `tty_path` and put it into raw mode.
    pub fn enter(tty_path: &Path) -> Result<Self, ConsoleError> {
        let tty = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NOCTTY)
            .open(tty_path)
            .map_err(|e| ConsoleError::resource("opening console terminal", e))?;

        let original =
            termios::tcgetattr(&tty).map_err(|e| ConsoleError::resource("reading terminal mode", e))?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&tty, SetArg::TCSANOW, &raw)
            .map_err(|e| ConsoleError::resource("setting raw mode", e))?;

        Ok(Self { tty, original })
    }

    /// Put the original settings back and close the terminal.
    pub fn restore(self) -> anyhow::Result<()> {
        termios::tcsetattr(&self.tty, SetArg::TCSANOW, &self.original)?;
        Ok(())
    }
}
