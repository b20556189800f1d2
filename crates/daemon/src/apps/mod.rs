//! Applications and the registry that tracks them.
//!
//! An application is a directory (usually a symlink) under the configured
//! root. The registry only knows about applications that have been looked
//! up at least once; [`resolver::resolve`] maps request keys onto them.

mod pool;
pub mod resolver;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use protocol::messages::{AppInfo, AppStatus};
use thiserror::Error;

pub use pool::AppPool;
pub use resolver::{resolve, strip_domain, strip_hex_suffix};

/// Errors from the application registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No directory exists for the requested name.
    #[error("unknown app: {0}")]
    UnknownApp(String),

    /// The name cannot be an application name.
    #[error("invalid app name: {0:?}")]
    InvalidName(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The registry collaborator the resolver and the supervisor depend on.
pub trait AppRegistry: Send + Sync {
    /// Directory application names are resolved against.
    fn root_dir(&self) -> &Path;

    /// Live application with exactly this name.
    fn get(&self, name: &str) -> Option<Arc<App>>;

    /// Snapshot of all live applications.
    fn apps(&self) -> Vec<Arc<App>>;

    /// Return the live application called `name`, registering it first if
    /// its directory exists under the root.
    fn lookup_or_create(&self, name: &str) -> Result<Arc<App>, RegistryError>;
}

#[derive(Debug, Default)]
struct AppState {
    status: AppStatus,
    pid: Option<u32>,
    consoles: BTreeSet<String>,
    last_log_line: Option<String>,
}

/// One application. Identity (name, directory) is fixed; only the runtime
/// state changes.
#[derive(Debug)]
pub struct App {
    name: String,
    dir: PathBuf,
    state: RwLock<AppState>,
}

impl App {
    /// Create an application rooted at `dir`.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            state: RwLock::new(AppState::default()),
        }
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Application directory, as registered (not canonicalized).
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current status.
    pub fn status(&self) -> AppStatus {
        self.read().status
    }

    /// Pid of the most recently started process.
    pub fn pid(&self) -> Option<u32> {
        self.read().pid
    }

    /// Labels of attached consoles.
    pub fn consoles(&self) -> Vec<String> {
        self.read().consoles.iter().cloned().collect()
    }

    /// Mark a process as starting.
    pub fn set_booting(&self) {
        self.write().status = AppStatus::Booting;
    }

    /// Record a running process.
    pub fn set_running(&self, pid: Option<u32>) {
        let mut state = self.write();
        state.status = AppStatus::Running;
        state.pid = pid;
    }

    /// Record that nothing is running any more. The last pid is kept.
    pub fn set_dead(&self) {
        self.write().status = AppStatus::Dead;
    }

    /// Attach a console label.
    pub fn attach_console(&self, label: &str) {
        self.write().consoles.insert(label.to_string());
    }

    /// Detach a console label. The app is considered dead once no console
    /// is left.
    pub fn detach_console(&self, label: &str) {
        let mut state = self.write();
        state.consoles.remove(label);
        if state.consoles.is_empty() {
            state.status = AppStatus::Dead;
        }
    }

    /// Remember the last line of output.
    pub fn record_log_line(&self, line: &str) {
        self.write().last_log_line = Some(line.trim().to_string());
    }

    /// Read-only view for management responses.
    pub fn info(&self) -> AppInfo {
        let state = self.read();
        AppInfo {
            name: self.name.clone(),
            dir: self.dir.display().to_string(),
            status: state.status,
            pid: state.pid,
            consoles: state.consoles.iter().cloned().collect(),
            last_log_line: state.last_log_line.clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AppState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AppState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_app_is_dead() {
        let app = App::new("blog", "/tmp/blog");
        assert_eq!(app.status(), AppStatus::Dead);
        assert_eq!(app.pid(), None);
        assert!(app.consoles().is_empty());
    }

    #[test]
    fn test_console_attach_detach() {
        let app = App::new("blog", "/tmp/blog");
        app.set_booting();
        app.attach_console("blog-rails");
        app.set_running(Some(42));
        assert_eq!(app.status(), AppStatus::Running);

        app.detach_console("blog-rails");
        assert_eq!(app.status(), AppStatus::Dead);
        assert_eq!(app.pid(), Some(42));
    }

    #[test]
    fn test_info() {
        let app = App::new("blog", "/srv/blog");
        app.attach_console("blog-irb");
        app.record_log_line("  ready\n");

        let info = app.info();
        assert_eq!(info.name, "blog");
        assert_eq!(info.dir, "/srv/blog");
        assert_eq!(info.consoles, vec!["blog-irb"]);
        assert_eq!(info.last_log_line.as_deref(), Some("ready"));
    }
}
