//! Management client used by the CLI to talk to a running daemon.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::messages::{ConsoleRequest, ManagementRequest, ManagementResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::server::IpcError;

/// Default timeout for one request/response exchange.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to the daemon's management socket.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at `path`. Fails when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;
        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send `request` and wait for the matching response.
    pub async fn send(&mut self, request: ManagementRequest) -> Result<ManagementResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn exchange(&mut self, request: ManagementRequest) -> Result<ManagementResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// True if the daemon answers with `Pong`.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(ManagementRequest::Ping).await?;
        Ok(matches!(response, ManagementResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::Stop).await
    }

    pub async fn list_apps(&mut self) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::ListApps).await
    }

    pub async fn get_app(&mut self, id: String, no_create: bool) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::GetApp { id, no_create }).await
    }

    pub async fn update_pool(
        &mut self,
        idle_timeout_secs: Option<u64>,
    ) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::UpdatePool { idle_timeout_secs })
            .await
    }

    pub async fn purge_apps(&mut self) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::PurgeApps).await
    }

    pub async fn start_console(&mut self, request: ConsoleRequest) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::StartConsole(request)).await
    }

    pub async fn kill_console(
        &mut self,
        app: String,
        key: String,
        reason: Option<String>,
    ) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::KillConsole { app, key, reason })
            .await
    }

    pub async fn list_consoles(&mut self) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::ListConsoles).await
    }

    pub async fn publish_event(
        &mut self,
        event: String,
        tags: Vec<String>,
    ) -> Result<ManagementResponse, IpcError> {
        self.send(ManagementRequest::PublishEvent { event, tags })
            .await
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}
