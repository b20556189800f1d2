//! # DevHub Protocol Library
//!
//! Wire types shared by the DevHub daemon and its management clients.
//!
//! ## Modules
//!
//! - [`messages`]: management requests and responses (JSON lines over the
//!   management socket)
//! - [`events`]: lifecycle event records streamed to observers
//! - [`error`]: protocol error type
//!
//! ## Example
//!
//! ```rust
//! use protocol::events::EventRecord;
//!
//! let record = EventRecord::new("app_ready").app("blog");
//! assert_eq!(record.routing_tags(), vec!["blog".to_string()]);
//! ```

pub mod error;
pub mod events;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use events::EventRecord;
pub use messages::{
    AppInfo, AppStatus, ConsoleInfo, ConsoleRequest, ConsoleState, ErrorKind, ManagementRequest,
    ManagementResponse,
};
