//! Console program supervision.
//!
//! A console program is an interactive child process attached to a
//! pseudo-terminal. [`ConsoleProgram::start`] launches it, races a readiness
//! tick against the supervision scope dying, and only returns once the
//! program is ready or has failed. Three tasks share the scope:
//!
//! - **watch**: waits for the scope to die (or the process to exit, which
//!   kills the scope), reaps the process and runs cleanup exactly once;
//! - **run**: marks the program ready after a short delay unless the scope
//!   dies first;
//! - **idle monitor**: kills the program once it has been idle too long.
//!
//! The pty, the resize relay and the terminal mode are released only through
//! the program's ordered cleanup list.

mod cleanup;
mod manager;
mod options;
mod program;
mod pty;
mod scope;

use std::time::Duration;

use thiserror::Error;

pub use cleanup::CleanupActions;
pub use manager::ConsoleManager;
pub use options::{resolve_launch, ConsoleProgramOptions, LaunchPlan};
pub use program::{wait_ready, ConsoleProgram, ProcessExit};
pub use pty::{local_size, FALLBACK_COLS, FALLBACK_ROWS};
pub use scope::Scope;

/// Shell used when neither the request nor the environment names one.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Delay after which a started program is considered ready.
pub const DEFAULT_READY_DELAY: Duration = Duration::from_millis(250);

/// How often the idle monitor checks the last-use time.
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// How long the watch task waits for the process after the scope dies
/// before escalating to `SIGKILL`.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Timing and default knobs shared by every console program.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Readiness delay.
    pub ready_delay: Duration,
    /// Idle monitor tick.
    pub idle_check_interval: Duration,
    /// Grace period before `SIGKILL`.
    pub kill_grace: Duration,
    /// Fallback shell.
    pub default_shell: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            ready_delay: DEFAULT_READY_DELAY,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
            default_shell: DEFAULT_SHELL.to_string(),
        }
    }
}

/// Broad classification of a [`ConsoleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad options; never retried.
    Config,
    /// The requested mode does not exist yet.
    NotImplemented,
    /// A system resource could not be set up.
    Resource,
    /// The program failed after it was started.
    Runtime,
    /// No such console program.
    NotFound,
}

/// Errors from console program supervision.
#[derive(Error, Debug, Clone)]
pub enum ConsoleError {
    /// Persistence was requested without a key.
    #[error("key not given for persistent console program")]
    MissingKey,

    /// Neither a shell nor an argument vector was given.
    #[error("no arguments given to launch console program")]
    NoArguments,

    /// The executable could not be found on the search path.
    #[error("could not find executable in PATH for command {0}")]
    ExecutableNotFound(String),

    /// The requested mode is not supported.
    #[error("{0} not yet implemented")]
    NotImplemented(&'static str),

    /// A console with this label is already running.
    #[error("console program already running: {0}")]
    AlreadyRunning(String),

    /// No console with this label.
    #[error("console program not found: {0}")]
    NotFound(String),

    /// Setting up a system resource failed.
    #[error("{what}: {message}")]
    Resource {
        /// What was being set up.
        what: &'static str,
        /// Underlying error.
        message: String,
    },

    /// The scope died before the program became ready.
    #[error("app died before booting")]
    DiedBeforeBooting,

    /// The process exited on its own.
    #[error("console program exited unexpectedly (exit code {code})")]
    UnexpectedExit {
        /// Exit code reported by the OS.
        code: u32,
    },

    /// The program was idle for longer than its timeout.
    #[error("console program idle for more than {0:?}")]
    IdleTimeout(Duration),

    /// The program was killed on request.
    #[error("console program killed: {reason}")]
    Killed {
        /// Reason given to the kill.
        reason: String,
    },

    /// The process has already exited, so it cannot be signalled.
    #[error("console program {0} has already exited")]
    AlreadyExited(String),

    /// Delivering a signal failed.
    #[error("failed to signal console program: {0}")]
    Signal(String),

    /// Startup failed; everything registered so far was cleaned up.
    #[error("starting console program {label}: {source}")]
    Startup {
        /// Label of the failed program.
        label: String,
        /// Cause.
        #[source]
        source: Box<ConsoleError>,
    },
}

impl ConsoleError {
    pub(crate) fn resource(what: &'static str, err: impl std::fmt::Display) -> Self {
        ConsoleError::Resource {
            what,
            message: err.to_string(),
        }
    }

    /// Classification of this error. Startup errors report their cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsoleError::MissingKey
            | ConsoleError::NoArguments
            | ConsoleError::ExecutableNotFound(_)
            | ConsoleError::AlreadyRunning(_) => ErrorKind::Config,
            ConsoleError::NotImplemented(_) => ErrorKind::NotImplemented,
            ConsoleError::Resource { .. } | ConsoleError::Signal(_) => ErrorKind::Resource,
            ConsoleError::DiedBeforeBooting
            | ConsoleError::UnexpectedExit { .. }
            | ConsoleError::IdleTimeout(_)
            | ConsoleError::Killed { .. }
            | ConsoleError::AlreadyExited(_) => ErrorKind::Runtime,
            ConsoleError::NotFound(_) => ErrorKind::NotFound,
            ConsoleError::Startup { source, .. } => source.kind(),
        }
    }
}
