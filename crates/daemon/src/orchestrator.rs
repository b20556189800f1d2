//! Daemon orchestrator wiring the event hub, the application pool, the
//! console supervisor and the two listeners together.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::events::EventRecord;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::apps::AppPool;
use crate::config::Config;
use crate::console::ConsoleManager;
use crate::events::EventEmitter;
use crate::hub::{EventsListener, Hub, HubHandle};
use crate::ipc::IpcServer;
use crate::management::ManagementService;

/// Extra time granted to consoles on shutdown beyond their kill grace.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding sockets and spawning tasks.
    Starting,
    /// Serving management and observer connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// The running daemon.
pub struct DevHub {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    hub: Option<Hub>,
    handle: HubHandle,
    events: EventEmitter,
    pool: Arc<AppPool>,
    consoles: Arc<ConsoleManager>,
    service: Arc<ManagementService>,
    socket_path: PathBuf,
    events_addr: Option<SocketAddr>,
    tasks: TaskTracker,
    shutdown_token: CancellationToken,
}

impl DevHub {
    /// Build every component. Nothing is bound or spawned until
    /// [`DevHub::start`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let (hub, handle) = Hub::new(config.hub_config());
        let events = EventEmitter::new(handle.clone());
        let pool = Arc::new(AppPool::new(&config.apps.root_dir));
        let consoles = Arc::new(ConsoleManager::new(
            events.clone(),
            config.supervisor_settings(),
        ));
        let shutdown_token = CancellationToken::new();
        let service = Arc::new(
            ManagementService::new(
                pool.clone(),
                consoles.clone(),
                handle.clone(),
                config.apps.domains.clone(),
                shutdown_token.clone(),
            )
            .with_default_idle_timeout(config.default_idle_timeout()),
        );

        Ok(Self {
            socket_path: config.socket_path(),
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            hub: Some(hub),
            handle,
            events,
            pool,
            consoles,
            service,
            events_addr: None,
            tasks: TaskTracker::new(),
            shutdown_token,
        })
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Bind the management socket and the observer endpoint and spawn the
    /// hub loop, the console reaper and both accept loops.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("DevHub is already running");
            }
            if self.hub.is_none() {
                anyhow::bail!("Event hub already consumed; DevHub cannot be restarted");
            }
            *state = OrchestratorState::Starting;
        }
        info!("Starting DevHub...");

        let (ipc, listener) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                if self.socket_path.exists() {
                    let _ = std::fs::remove_file(&self.socket_path);
                }
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e);
            }
        };
        self.events_addr = Some(listener.local_addr()?);

        let hub = self
            .hub
            .take()
            .context("Event hub already consumed; DevHub cannot be restarted")?;
        self.tasks.spawn(hub.run());
        self.tasks
            .spawn(ipc.run(self.service.clone(), self.shutdown_token.clone()));
        self.tasks.spawn(listener.run(self.shutdown_token.clone()));
        self.consoles
            .start_reaper(self.config.reap_interval(), self.shutdown_token.clone());
        debug!("Started hub, listeners and console reaper");

        *self.state.write().await = OrchestratorState::Running;
        self.events
            .emit(
                EventRecord::new("daemon_started")
                    .field("socket", self.socket_path.display().to_string())
                    .field("events", self.events_addr.map(|a| a.to_string())),
            )
            .await;

        info!(
            socket = %self.socket_path.display(),
            events = ?self.events_addr,
            root = %self.config.apps.root_dir.display(),
            "DevHub started"
        );
        Ok(())
    }

    async fn bind(&self) -> Result<(IpcServer, EventsListener)> {
        let ipc = IpcServer::bind(&self.socket_path).await.with_context(|| {
            format!("Failed to bind management socket: {}", self.socket_path.display())
        })?;
        let listener = EventsListener::bind(self.config.daemon.events_addr, self.handle.clone())
            .await
            .with_context(|| {
                format!("Failed to bind events listener: {}", self.config.daemon.events_addr)
            })?;
        Ok((ipc, listener))
    }

    /// Kill every console, stop the hub and the listeners, and remove the
    /// management socket.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::ShuttingDown => {
                    anyhow::bail!("DevHub is already shutting down")
                }
                _ => *state = OrchestratorState::ShuttingDown,
            }
        }
        info!("Stopping DevHub...");

        let killed = self.consoles.kill_all("daemon shutdown").await;
        let limit = self.config.supervisor_settings().kill_grace + SHUTDOWN_SLACK;
        if !self.consoles.wait_all(limit).await {
            warn!(killed, "Some consoles did not finish cleaning up");
        }

        self.shutdown_token.cancel();
        self.handle.stop();
        self.tasks.close();
        if tokio::time::timeout(limit, self.tasks.wait()).await.is_err() {
            warn!("Background tasks did not stop in time");
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "Failed to remove management socket");
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        info!(killed, apps = self.pool.len(), "DevHub stopped");
        Ok(())
    }

    /// Address observers connect to, once started.
    pub fn events_addr(&self) -> Option<SocketAddr> {
        self.events_addr
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub fn hub(&self) -> &HubHandle {
        &self.handle
    }

    pub fn consoles(&self) -> &Arc<ConsoleManager> {
        &self.consoles
    }

    pub fn pool(&self) -> &Arc<AppPool> {
        &self.pool
    }

    /// Cancelled when a stop is requested, including over the management
    /// socket.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
