//! Registry of live console programs, keyed by label.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use protocol::messages::{ConsoleInfo, ConsoleState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{resolve_launch, ConsoleError, ConsoleProgram, ConsoleProgramOptions, SupervisorSettings};
use crate::apps::App;
use crate::events::EventEmitter;

/// Tracks every console program started through the daemon.
pub struct ConsoleManager {
    consoles: DashMap<String, Arc<ConsoleProgram>>,
    starting: DashSet<String>,
    events: EventEmitter,
    settings: SupervisorSettings,
}

impl ConsoleManager {
    pub fn new(events: EventEmitter, settings: SupervisorSettings) -> Self {
        Self {
            consoles: DashMap::new(),
            starting: DashSet::new(),
            events,
            settings,
        }
    }

    /// Start a console program for `app`.
    ///
    /// A label can only be used by one live program at a time; dead
    /// programs under the same label are replaced.
    pub async fn start(
        &self,
        app: Arc<App>,
        options: &ConsoleProgramOptions,
    ) -> Result<Arc<ConsoleProgram>, ConsoleError> {
        let plan = resolve_launch(app.name(), app.dir(), options, &self.settings)?;

        let _reservation = Reservation::take(&self.starting, &plan.label)
            .ok_or_else(|| ConsoleError::AlreadyRunning(plan.label.clone()))?;
        if let Some(existing) = self.get(&plan.label) {
            if existing.state() != ConsoleState::Dead {
                return Err(ConsoleError::AlreadyRunning(plan.label));
            }
            self.consoles.remove(&plan.label);
        }

        let program =
            ConsoleProgram::launch(app, plan, self.events.clone(), self.settings.clone()).await?;
        self.consoles
            .insert(program.label().to_string(), program.clone());
        tracing::debug!(label = %program.label(), total = self.consoles.len(), "Console registered");
        Ok(program)
    }

    /// Kill the console registered under `label`.
    pub async fn kill(&self, label: &str, reason: &str) -> Result<(), ConsoleError> {
        let program = self
            .get(label)
            .ok_or_else(|| ConsoleError::NotFound(label.to_string()))?;
        program.kill(reason).await
    }

    /// Kill every live console. Returns how many were signalled.
    pub async fn kill_all(&self, reason: &str) -> usize {
        let programs: Vec<_> = self.consoles.iter().map(|e| e.value().clone()).collect();
        let mut killed = 0;
        for program in programs {
            if program.state() == ConsoleState::Dead {
                continue;
            }
            match program.kill(reason).await {
                Ok(()) => killed += 1,
                Err(e) => tracing::debug!(label = %program.label(), error = %e, "Console not killed"),
            }
        }
        killed
    }

    /// Wait until every registered console has finished cleaning up, or
    /// `limit` elapses. Returns false on timeout.
    pub async fn wait_all(&self, limit: Duration) -> bool {
        let programs: Vec<_> = self.consoles.iter().map(|e| e.value().clone()).collect();
        let all = async {
            for program in programs {
                program.wait().await;
            }
        };
        tokio::time::timeout(limit, all).await.is_ok()
    }

    pub fn get(&self, label: &str) -> Option<Arc<ConsoleProgram>> {
        self.consoles.get(label).map(|e| e.value().clone())
    }

    /// Find a console by application name and key.
    pub fn find(&self, app: &str, key: &str) -> Option<Arc<ConsoleProgram>> {
        self.get(&format!("{app}-{key}"))
    }

    /// Snapshot of every registered console, sorted by label.
    pub fn list(&self) -> Vec<ConsoleInfo> {
        let mut consoles: Vec<_> = self.consoles.iter().map(|e| e.value().info()).collect();
        consoles.sort_by(|a, b| a.label.cmp(&b.label));
        consoles
    }

    /// Drop dead consoles from the registry. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let before = self.consoles.len();
        self.consoles
            .retain(|_, program| program.state() != ConsoleState::Dead);
        before - self.consoles.len()
    }

    /// Periodically reap dead consoles until `shutdown` fires.
    pub fn start_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = manager.reap();
                        if reaped > 0 {
                            tracing::debug!(reaped, "Reaped dead consoles");
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.consoles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consoles.is_empty()
    }
}

/// Claim on a label while its program is launching. Released on drop, so a
/// failed or abandoned launch frees the label.
struct Reservation<'a> {
    starting: &'a DashSet<String>,
    label: String,
}

impl<'a> Reservation<'a> {
    fn take(starting: &'a DashSet<String>, label: &str) -> Option<Self> {
        starting.insert(label.to_string()).then(|| Self {
            starting,
            label: label.to_string(),
        })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubConfig};
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn manager() -> ConsoleManager {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());
        let settings = SupervisorSettings {
            ready_delay: Duration::from_millis(50),
            idle_check_interval: Duration::from_millis(50),
            kill_grace: Duration::from_secs(1),
            default_shell: "/bin/sh".to_string(),
        };
        ConsoleManager::new(EventEmitter::new(handle), settings)
    }

    fn options(key: &str, command: &str) -> ConsoleProgramOptions {
        ConsoleProgramOptions {
            key: Some(key.to_string()),
            argv: vec![command.to_string()],
            shell: Some("/bin/sh".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_label_rejected_until_dead() {
        let dir = TempDir::new().unwrap();
        let app = Arc::new(App::new("blog", dir.path()));
        let manager = manager();

        let first = manager
            .start(app.clone(), &options("web", "sleep 30"))
            .await
            .unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.find("blog", "web").is_some());

        let err = manager
            .start(app.clone(), &options("web", "sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::AlreadyRunning(label) if label == "blog-web"));

        manager.kill("blog-web", "test").await.unwrap();
        timeout(Duration::from_secs(5), first.wait()).await.unwrap();

        assert_eq!(manager.list()[0].state, ConsoleState::Dead);
        assert_eq!(manager.reap(), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_starts_launch_one_program() {
        let dir = TempDir::new().unwrap();
        let app = Arc::new(App::new("blog", dir.path()));
        let manager = manager();
        let opts = options("web", "sleep 30");

        let (a, b) = tokio::join!(
            manager.start(app.clone(), &opts),
            manager.start(app.clone(), &opts)
        );
        let (winner, err) = match (a, b) {
            (Ok(program), Err(e)) | (Err(e), Ok(program)) => (program, e),
            (a, b) => panic!("expected exactly one start to succeed: {a:?} {b:?}"),
        };
        assert!(matches!(err, ConsoleError::AlreadyRunning(label) if label == "blog-web"));
        assert_eq!(manager.len(), 1);
        assert!(Arc::ptr_eq(&manager.get("blog-web").unwrap(), &winner));

        manager.kill("blog-web", "test").await.unwrap();
        timeout(Duration::from_secs(5), winner.wait()).await.unwrap();
    }

    #[test]
    fn test_reservation_is_exclusive_until_dropped() {
        let starting = DashSet::new();

        let first = Reservation::take(&starting, "blog-web").unwrap();
        assert!(Reservation::take(&starting, "blog-web").is_none());
        assert!(Reservation::take(&starting, "blog-api").is_some());

        drop(first);
        assert!(Reservation::take(&starting, "blog-web").is_some());
        assert!(starting.is_empty());
    }

    #[tokio::test]
    async fn test_kill_unknown_label() {
        let manager = manager();
        let err = manager.kill("nope-web", "test").await.unwrap_err();
        assert!(matches!(err, ConsoleError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_kill_all() {
        let dir = TempDir::new().unwrap();
        let app = Arc::new(App::new("blog", dir.path()));
        let manager = manager();

        let a = manager.start(app.clone(), &options("a", "sleep 30")).await.unwrap();
        let b = manager.start(app.clone(), &options("b", "sleep 30")).await.unwrap();

        assert_eq!(manager.kill_all("purge").await, 2);
        assert!(manager.wait_all(Duration::from_secs(5)).await);
        assert_eq!(a.state(), ConsoleState::Dead);
        assert_eq!(b.state(), ConsoleState::Dead);
        assert!(app.consoles().is_empty());
    }
}
