//! # DevHub Daemon Library
//!
//! The management layer of a local development proxy: it supervises
//! interactive console programs for applications, resolves request keys to
//! applications, and streams lifecycle events to observers over WebSocket.
//!
//! ## Overview
//!
//! - **Console supervision**: programs run under a pseudo-terminal with a
//!   readiness race, idle timeout, resize relay and exactly-once cleanup
//! - **Event hub**: a single-writer broadcast loop with tag subscriptions
//!   and eviction of slow observers
//! - **Identity resolution**: request keys such as `blog.test` or
//!   `blog-a1b2c3` map onto application directories
//! - **Management**: a JSON-lines unix socket used by the `devhub` CLI
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            DevHub                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────────┐   ┌────────────────┐   │
//! │  │   AppPool +  │◄──│    Management    │──►│    Console     │   │
//! │  │   resolver   │   │     service      │   │    manager     │   │
//! │  └──────────────┘   └──────────────────┘   └───────┬────────┘   │
//! │         ▲                    ▲                     │ events     │
//! │         │            ┌───────┴────────┐    ┌───────▼────────┐   │
//! │         └────────────│  IPC (unix)    │    │   Event hub    │   │
//! │                      └────────────────┘    └───────┬────────┘   │
//! │                                            ┌───────▼────────┐   │
//! │                                            │ WebSocket pumps│   │
//! │                                            └────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devhub::{Config, DevHub};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut devhub = DevHub::new(Config::load_default()?)?;
//!     devhub.start().await?;
//!
//!     devhub.shutdown_token().cancelled().await;
//!
//!     devhub.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: configuration loading and defaults
//! - [`hub`]: event hub, observer clients and WebSocket pumps
//! - [`events`]: lifecycle event publishing
//! - [`apps`]: application registry and identity resolver
//! - [`console`]: console program supervisor
//! - [`management`]: request handling for the CLI
//! - [`ipc`]: management socket transport
//! - [`orchestrator`]: top-level wiring

pub mod apps;
pub mod config;
pub mod console;
pub mod events;
pub mod hub;
pub mod ipc;
pub mod management;
pub mod orchestrator;

// Re-export protocol for convenience
pub use protocol;

pub use apps::{App, AppPool, AppRegistry, RegistryError};
pub use config::{Config, ConfigError};
pub use console::{
    ConsoleError, ConsoleManager, ConsoleProgram, ConsoleProgramOptions, SupervisorSettings,
};
pub use events::EventEmitter;
pub use hub::{Client, EventsListener, Hub, HubConfig, HubError, HubHandle, Subscriptions};
pub use management::ManagementService;
pub use orchestrator::{DevHub, OrchestratorState};
