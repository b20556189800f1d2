//! Management message definitions for DevHub.
//!
//! This module defines the request and response types exchanged between the
//! `devhub` CLI (or any other management client) and the daemon. Messages are
//! serialized as JSON, one object per line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Requests that can be sent to the daemon's management socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ManagementRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all known applications.
    ListApps,
    /// Resolve a single application by key.
    GetApp {
        /// Request key: an app name, a domain or a suffixed checkout name.
        id: String,
        /// When set, resolution never registers a new application.
        #[serde(default)]
        no_create: bool,
    },
    /// Change pool settings at runtime.
    UpdatePool {
        /// New default idle timeout for consoles, in seconds. Left unchanged
        /// when absent.
        #[serde(default)]
        idle_timeout_secs: Option<u64>,
    },
    /// Kill every console, forget every application and drop every observer.
    PurgeApps,
    /// Start a console program and wait until it is ready.
    StartConsole(ConsoleRequest),
    /// Kill a running console program.
    KillConsole {
        /// Application name (or any key the resolver accepts).
        app: String,
        /// Console key within the application.
        key: String,
        /// Reason recorded in the kill event.
        #[serde(default)]
        reason: Option<String>,
    },
    /// List live console programs.
    ListConsoles,
    /// Publish an externally produced JSON event to observers.
    PublishEvent {
        /// The event, a JSON object. An `app` field and a `tags` array add
        /// routing tags.
        event: String,
        /// Extra routing tags.
        #[serde(default)]
        tags: Vec<String>,
    },
}

/// Wire form of the options used to launch a console program.
///
/// Every field is optional; the daemon applies its own defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleRequest {
    /// Application key, resolved by the daemon.
    pub app: String,
    /// Console key. Defaults to the base name of the first argument.
    pub key: Option<String>,
    /// Working directory. Defaults to the application directory.
    pub dir: Option<String>,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
    /// Command to run.
    pub argv: Vec<String>,
    /// Run the command through a shell (`-c`).
    pub use_shell: Option<bool>,
    /// Shell override.
    pub shell: Option<String>,
    /// Extra arguments passed to the shell before `-c`.
    pub shell_args: Vec<String>,
    /// Keep the console around after the request finishes.
    pub persist: Option<bool>,
    /// Start the shell as an interactive login shell.
    pub interactive: Option<bool>,
    /// Attach the child to a pseudo-terminal.
    pub alloc_pty: Option<bool>,
    /// Kill the console after this many idle seconds.
    pub idle_timeout_secs: Option<u64>,
}

/// Responses sent from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ManagementResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of registered applications.
        app_count: usize,
        /// Number of live console programs.
        console_count: usize,
        /// Number of connected event observers.
        observer_count: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// All known applications.
    Apps {
        /// One entry per application.
        apps: Vec<AppInfo>,
    },
    /// A single resolved application.
    App(AppInfo),
    /// Pool settings after an update.
    PoolUpdated {
        /// Default idle timeout for consoles, in seconds.
        idle_timeout_secs: Option<u64>,
    },
    /// Result of a purge.
    Purged {
        /// Applications forgotten.
        apps: usize,
        /// Consoles killed.
        consoles: usize,
        /// Observers disconnected.
        observers: usize,
    },
    /// A console program is ready.
    ConsoleStarted(ConsoleInfo),
    /// A console program was signalled.
    ConsoleKilled {
        /// Label of the killed console.
        label: String,
    },
    /// Live console programs.
    Consoles {
        /// One entry per console.
        consoles: Vec<ConsoleInfo>,
    },
    /// The event was handed to the hub.
    Published,
    /// An error occurred processing the request.
    Error {
        /// Error classification.
        kind: ErrorKind,
        /// Human-readable error message.
        message: String,
    },
}

impl ManagementResponse {
    /// Build an error response.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ManagementResponse::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Classification of a failed management request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The application or console does not exist.
    NotFound,
    /// The request was malformed or its options are inconsistent.
    InvalidRequest,
    /// The requested mode is not supported.
    NotImplemented,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// HTTP-style status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidRequest => 422,
            ErrorKind::NotImplemented => 501,
            ErrorKind::Internal => 500,
        }
    }
}

/// Liveness of an application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    /// A process is starting for this application.
    Booting,
    /// A process is running.
    Running,
    /// Nothing is running.
    #[default]
    Dead,
}

/// Read-only view of an application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppInfo {
    /// Application name.
    pub name: String,
    /// Application directory.
    pub dir: String,
    /// Current status.
    pub status: AppStatus,
    /// Pid of the running process, if any.
    pub pid: Option<u32>,
    /// Labels of the console programs attached to this application.
    pub consoles: Vec<String>,
    /// Last line of output seen from any of its consoles.
    pub last_log_line: Option<String>,
}

/// Lifecycle state of a console program.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleState {
    /// Started but not ready yet.
    Starting,
    /// Ready and running.
    Ready,
    /// Being torn down.
    Dying,
    /// Exited and cleaned up.
    Dead,
}

/// Read-only view of a console program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleInfo {
    /// Owning application.
    pub app: String,
    /// Console key.
    pub key: String,
    /// `<app>-<key>`.
    pub label: String,
    /// Shell-quoted command line actually executed.
    pub command_line: String,
    /// Child pid.
    pub pid: Option<u32>,
    /// Current state.
    pub state: ConsoleState,
    /// Path of the pseudo-terminal, when known.
    pub tty: Option<String>,
    /// Whether the console was started with a stable key.
    #[serde(default)]
    pub persist: bool,
    /// Idle timeout in seconds.
    pub idle_timeout_secs: Option<u64>,
}
