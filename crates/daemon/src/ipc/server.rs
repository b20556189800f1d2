//! Management server: accepts CLI connections on the unix socket and hands
//! each request to the [`ManagementService`].

use std::io;
use std::path::Path;
use std::sync::Arc;

use protocol::messages::{ErrorKind, ManagementRequest, ManagementResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::management::ManagementService;

/// Listens for management connections on a unix domain socket.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    /// Bind to `path`, creating parent directories and replacing a stale
    /// socket file.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        Ok(Self { listener })
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Accept connections until `shutdown` fires, serving each on its own
    /// task.
    pub async fn run(self, service: Arc<ManagementService>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        let service = service.clone();
                        tokio::spawn(conn.serve(service));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept management connection");
                    }
                },
            }
        }
        tracing::debug!("Management server stopped");
    }
}

/// One client connection speaking newline-delimited JSON.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request. `None` once the client hung up.
    pub async fn read_request(&mut self) -> Result<Option<ManagementRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    pub async fn send_response(&mut self, response: &ManagementResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Answer requests until the client disconnects. Malformed requests get
    /// an `invalid_request` error and the connection stays open.
    pub async fn serve(mut self, service: Arc<ManagementService>) {
        loop {
            let response = match self.read_request().await {
                Ok(Some(request)) => service.handle(request).await,
                Ok(None) => break,
                Err(IpcError::Json(e)) => {
                    ManagementResponse::error(ErrorKind::InvalidRequest, e.to_string())
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Management connection failed");
                    break;
                }
            };

            if let Err(e) = self.send_response(&response).await {
                tracing::debug!(error = %e, "Failed to send management response");
                break;
            }
        }
    }
}

/// Errors on the management transport.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
