//! Management transport between the CLI and the daemon.
//!
//! Requests and responses are [`protocol::messages`] values encoded as one
//! JSON object per line over a unix domain socket.
//!
//! The socket lives at `$XDG_RUNTIME_DIR/devhub/mgmt.sock`, or
//! `/tmp/devhub-$UID/mgmt.sock` when no runtime directory is set.
//!
//! ```rust,no_run
//! use devhub::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("daemon is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod server;

pub use client::IpcClient;
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Default location of the management socket.
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("devhub").join("mgmt.sock")
        }
        _ => {
            let uid = std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0);
            PathBuf::from(format!("/tmp/devhub-{uid}")).join("mgmt.sock")
        }
    }
}
