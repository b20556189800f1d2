//! The concrete application registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use super::{App, AppRegistry, RegistryError};

/// Applications discovered under a root directory.
pub struct AppPool {
    root_dir: PathBuf,
    apps: DashMap<String, Arc<App>>,
}

impl AppPool {
    /// Create an empty pool rooted at `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            apps: DashMap::new(),
        }
    }

    /// Register an application with an explicit directory, replacing any
    /// application of the same name.
    pub fn insert(&self, name: &str, dir: impl Into<PathBuf>) -> Arc<App> {
        let app = Arc::new(App::new(name, dir));
        self.apps.insert(name.to_string(), app.clone());
        tracing::debug!(app = %name, "Registered app");
        app
    }

    /// Forget one application.
    pub fn remove(&self, name: &str) -> Option<Arc<App>> {
        self.apps.remove(name).map(|(_, app)| app)
    }

    /// Forget every application. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let count = self.apps.len();
        self.apps.clear();
        tracing::info!(count, "Purged app pool");
        count
    }

    /// Number of live applications.
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    /// True if no application is registered.
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl AppRegistry for AppPool {
    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn get(&self, name: &str) -> Option<Arc<App>> {
        self.apps.get(name).map(|entry| entry.value().clone())
    }

    fn apps(&self) -> Vec<Arc<App>> {
        let mut apps: Vec<Arc<App>> = self.apps.iter().map(|e| e.value().clone()).collect();
        apps.sort_by(|a, b| a.name().cmp(b.name()));
        apps
    }

    fn lookup_or_create(&self, name: &str) -> Result<Arc<App>, RegistryError> {
        if let Some(app) = self.get(name) {
            return Ok(app);
        }
        validate_name(name)?;

        let dir = self.root_dir.join(name);
        match std::fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(RegistryError::UnknownApp(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::UnknownApp(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        let app = self
            .apps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(App::new(name, dir)))
            .value()
            .clone();
        tracing::info!(app = %name, dir = %app.dir().display(), "Registered app");
        Ok(app)
    }
}
