//! Management façade: turns [`ManagementRequest`]s into registry, supervisor
//! and hub operations.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use protocol::messages::{ErrorKind, ManagementRequest, ManagementResponse};
use protocol::ConsoleRequest;
use tokio_util::sync::CancellationToken;

use crate::apps::{resolve, strip_domain, App, AppPool, AppRegistry};
use crate::console::{self, ConsoleError, ConsoleManager, ConsoleProgramOptions};
use crate::events::EventEmitter;
use crate::hub::HubHandle;

/// Shortest idle timeout accepted by [`ManagementRequest::UpdatePool`].
pub const MIN_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Request handler shared by every management connection.
pub struct ManagementService {
    pool: Arc<AppPool>,
    consoles: Arc<ConsoleManager>,
    hub: HubHandle,
    events: EventEmitter,
    domains: Vec<String>,
    default_idle_timeout: RwLock<Option<Duration>>,
    started: Instant,
    shutdown: CancellationToken,
}

impl ManagementService {
    pub fn new(
        pool: Arc<AppPool>,
        consoles: Arc<ConsoleManager>,
        hub: HubHandle,
        domains: Vec<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            consoles,
            events: EventEmitter::new(hub.clone()),
            hub,
            domains,
            default_idle_timeout: RwLock::new(None),
            started: Instant::now(),
            shutdown,
        }
    }

    /// Idle timeout for consoles started without one.
    pub fn with_default_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_idle_timeout = RwLock::new(timeout);
        self
    }

    /// Handle one request. Never fails; errors become
    /// [`ManagementResponse::Error`].
    pub async fn handle(&self, request: ManagementRequest) -> ManagementResponse {
        tracing::debug!(?request, "Handling management request");

        match request {
            ManagementRequest::Ping => ManagementResponse::Pong,
            ManagementRequest::Status => ManagementResponse::Status {
                running: !self.shutdown.is_cancelled(),
                uptime_secs: self.started.elapsed().as_secs(),
                app_count: self.pool.len(),
                console_count: self.consoles.len(),
                observer_count: self.hub.client_count().await.unwrap_or(0),
            },
            ManagementRequest::Stop => {
                tracing::info!("Stop requested over management socket");
                self.shutdown.cancel();
                ManagementResponse::Stopping
            }
            ManagementRequest::ListApps => ManagementResponse::Apps {
                apps: self.pool.apps().iter().map(|app| app.info()).collect(),
            },
            ManagementRequest::GetApp { id, no_create } => match self.resolve(&id, !no_create) {
                Ok(app) => ManagementResponse::App(app.info()),
                Err(response) => response,
            },
            ManagementRequest::UpdatePool { idle_timeout_secs } => {
                self.update_pool(idle_timeout_secs)
            }
            ManagementRequest::PurgeApps => self.purge().await,
            ManagementRequest::StartConsole(request) => self.start_console(request).await,
            ManagementRequest::KillConsole { app, key, reason } => {
                self.kill_console(&app, &key, reason.as_deref()).await
            }
            ManagementRequest::ListConsoles => ManagementResponse::Consoles {
                consoles: self.consoles.list(),
            },
            ManagementRequest::PublishEvent { event, tags } => {
                match self.events.forward(&event, &tags).await {
                    Ok(()) => ManagementResponse::Published,
                    Err(e) => ManagementResponse::error(ErrorKind::InvalidRequest, e.to_string()),
                }
            }
        }
    }

    fn resolve(&self, id: &str, allow_create: bool) -> Result<Arc<App>, ManagementResponse> {
        let key = strip_domain(id, &self.domains);
        resolve(self.pool.as_ref(), key, allow_create).ok_or_else(|| {
            ManagementResponse::error(ErrorKind::NotFound, format!("unknown app: {id}"))
        })
    }

    async fn start_console(&self, request: ConsoleRequest) -> ManagementResponse {
        let app = match self.resolve(&request.app, true) {
            Ok(app) => app,
            Err(response) => return response,
        };
        let mut options = ConsoleProgramOptions::from(request);
        if options.idle_timeout.is_none() {
            options.idle_timeout = self.default_idle_timeout();
        }

        match self.consoles.start(app, &options).await {
            Ok(program) => ManagementResponse::ConsoleStarted(program.info()),
            Err(e) => console_error(e),
        }
    }

    async fn kill_console(&self, app: &str, key: &str, reason: Option<&str>) -> ManagementResponse {
        let app = match self.resolve(app, false) {
            Ok(app) => app,
            Err(response) => return response,
        };
        let label = format!("{}-{key}", app.name());

        match self
            .consoles
            .kill(&label, reason.unwrap_or("killed over management socket"))
            .await
        {
            Ok(()) => ManagementResponse::ConsoleKilled { label },
            Err(e) => console_error(e),
        }
    }

    /// Idle timeout applied to consoles started without one.
    pub fn default_idle_timeout(&self) -> Option<Duration> {
        *self
            .default_idle_timeout
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn update_pool(&self, idle_timeout_secs: Option<u64>) -> ManagementResponse {
        if let Some(secs) = idle_timeout_secs {
            let timeout = Duration::from_secs(secs);
            if timeout < MIN_POOL_IDLE_TIMEOUT {
                return ManagementResponse::error(
                    ErrorKind::InvalidRequest,
                    format!(
                        "idle timeout must be at least {}s",
                        MIN_POOL_IDLE_TIMEOUT.as_secs()
                    ),
                );
            }
            *self
                .default_idle_timeout
                .write()
                .unwrap_or_else(|e| e.into_inner()) = Some(timeout);
            tracing::info!(idle_timeout_secs = secs, "Updated pool idle timeout");
        }
        ManagementResponse::PoolUpdated {
            idle_timeout_secs: self.default_idle_timeout().map(|t| t.as_secs()),
        }
    }

    async fn purge(&self) -> ManagementResponse {
        let consoles = self.consoles.kill_all("purge").await;
        let apps = self.pool.purge();
        let observers = match self.hub.unregister_all().await {
            Ok(count) => count,
            Err(e) => return ManagementResponse::error(ErrorKind::Internal, e.to_string()),
        };
        tracing::info!(apps, consoles, observers, "Purged everything");
        ManagementResponse::Purged {
            apps,
            consoles,
            observers,
        }
    }
}

fn console_error(err: ConsoleError) -> ManagementResponse {
    let kind = match err.kind() {
        console::ErrorKind::Config => ErrorKind::InvalidRequest,
        console::ErrorKind::NotImplemented => ErrorKind::NotImplemented,
        console::ErrorKind::NotFound => ErrorKind::NotFound,
        console::ErrorKind::Resource | console::ErrorKind::Runtime => ErrorKind::Internal,
    };
    tracing::warn!(error = %err, "Console request failed");
    ManagementResponse::error(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::SupervisorSettings;
    use crate::hub::{Hub, HubConfig};
    use protocol::messages::AppStatus;
    use tempfile::TempDir;

    fn service(root: &TempDir) -> (ManagementService, CancellationToken) {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());
        let settings = SupervisorSettings {
            ready_delay: Duration::from_millis(50),
            kill_grace: Duration::from_secs(1),
            default_shell: "/bin/sh".to_string(),
            ..Default::default()
        };
        let consoles = Arc::new(ConsoleManager::new(EventEmitter::new(handle.clone()), settings));
        let shutdown = CancellationToken::new();
        let service = ManagementService::new(
            Arc::new(AppPool::new(root.path())),
            consoles,
            handle,
            vec!["test".to_string()],
            shutdown.clone(),
        );
        (service, shutdown)
    }

    #[tokio::test]
    async fn test_get_app_strips_domain() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let (service, _) = service(&root);

        let response = service
            .handle(ManagementRequest::GetApp {
                id: "blog.test".to_string(),
                no_create: false,
            })
            .await;

        match response {
            ManagementResponse::App(info) => {
                assert_eq!(info.name, "blog");
                assert_eq!(info.status, AppStatus::Dead);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_app_not_found() {
        let root = TempDir::new().unwrap();
        let (service, _) = service(&root);

        let response = service
            .handle(ManagementRequest::GetApp {
                id: "missing".to_string(),
                no_create: false,
            })
            .await;

        assert!(matches!(
            response,
            ManagementResponse::Error {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_no_create_does_not_register() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let (service, _) = service(&root);

        let response = service
            .handle(ManagementRequest::GetApp {
                id: "blog".to_string(),
                no_create: true,
            })
            .await;

        assert!(matches!(response, ManagementResponse::Error { .. }));
        assert!(matches!(
            service.handle(ManagementRequest::ListApps).await,
            ManagementResponse::Apps { apps } if apps.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_start_console_config_error_maps_to_invalid_request() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let (service, _) = service(&root);

        let response = service
            .handle(ManagementRequest::StartConsole(ConsoleRequest {
                app: "blog".to_string(),
                argv: vec!["sleep 30".to_string()],
                persist: Some(true),
                ..Default::default()
            }))
            .await;

        match response {
            ManagementResponse::Error { kind, .. } => {
                assert_eq!(kind, ErrorKind::InvalidRequest);
                assert_eq!(kind.status_code(), 422);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_console_without_pty_is_not_implemented() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let (service, _) = service(&root);

        let response = service
            .handle(ManagementRequest::StartConsole(ConsoleRequest {
                app: "blog".to_string(),
                key: Some("web".to_string()),
                argv: vec!["sleep 30".to_string()],
                alloc_pty: Some(false),
                ..Default::default()
            }))
            .await;

        assert!(matches!(
            response,
            ManagementResponse::Error {
                kind: ErrorKind::NotImplemented,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_kill_unknown_console() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let (service, _) = service(&root);
        service
            .handle(ManagementRequest::GetApp {
                id: "blog".to_string(),
                no_create: false,
            })
            .await;

        let response = service
            .handle(ManagementRequest::KillConsole {
                app: "blog".to_string(),
                key: "web".to_string(),
                reason: None,
            })
            .await;

        assert!(matches!(
            response,
            ManagementResponse::Error {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_purge_resets_everything() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let (service, _) = service(&root);
        service
            .handle(ManagementRequest::GetApp {
                id: "blog".to_string(),
                no_create: false,
            })
            .await;
        let (_client, _outbox) = service.hub.connect(["*"]).await.unwrap();

        let response = service.handle(ManagementRequest::PurgeApps).await;

        assert_eq!(
            response,
            ManagementResponse::Purged {
                apps: 1,
                consoles: 0,
                observers: 1,
            }
        );
        assert_eq!(service.hub.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_pool_sets_default_idle_timeout() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let (service, _) = service(&root);

        let rejected = service
            .handle(ManagementRequest::UpdatePool {
                idle_timeout_secs: Some(30),
            })
            .await;
        assert!(matches!(
            rejected,
            ManagementResponse::Error {
                kind: ErrorKind::InvalidRequest,
                ..
            }
        ));
        assert_eq!(service.default_idle_timeout(), None);

        assert_eq!(
            service
                .handle(ManagementRequest::UpdatePool {
                    idle_timeout_secs: Some(120),
                })
                .await,
            ManagementResponse::PoolUpdated {
                idle_timeout_secs: Some(120)
            }
        );
        assert_eq!(
            service
                .handle(ManagementRequest::UpdatePool {
                    idle_timeout_secs: None,
                })
                .await,
            ManagementResponse::PoolUpdated {
                idle_timeout_secs: Some(120)
            }
        );

        let response = service
            .handle(ManagementRequest::StartConsole(ConsoleRequest {
                app: "blog".to_string(),
                key: Some("web".to_string()),
                argv: vec!["sleep 30".to_string()],
                ..Default::default()
            }))
            .await;
        let ManagementResponse::ConsoleStarted(info) = response else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(info.idle_timeout_secs, Some(120));

        service.consoles.kill_all("test").await;
        assert!(service.consoles.wait_all(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_publish_event_reaches_observers() {
        let root = TempDir::new().unwrap();
        let (service, _) = service(&root);
        let (_client, mut outbox) = service.hub.connect(["blog"]).await.unwrap();

        let rejected = service
            .handle(ManagementRequest::PublishEvent {
                event: "not json".to_string(),
                tags: vec![],
            })
            .await;
        assert!(matches!(
            rejected,
            ManagementResponse::Error {
                kind: ErrorKind::InvalidRequest,
                ..
            }
        ));

        let response = service
            .handle(ManagementRequest::PublishEvent {
                event: r#"{"event":"deployed","app":"blog"}"#.to_string(),
                tags: vec![],
            })
            .await;
        assert_eq!(response, ManagementResponse::Published);

        let frame = tokio::time::timeout(Duration::from_secs(1), outbox.recv())
            .await
            .expect("timeout")
            .expect("outbox closed");
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["event"], "deployed");
    }

    #[tokio::test]
    async fn test_stop_cancels_shutdown() {
        let root = TempDir::new().unwrap();
        let (service, shutdown) = service(&root);

        assert_eq!(
            service.handle(ManagementRequest::Stop).await,
            ManagementResponse::Stopping
        );
        assert!(shutdown.is_cancelled());
    }
}
