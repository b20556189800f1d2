//! Event hub.
//!
//! A single-writer broadcast actor that tracks connected observers and fans
//! tagged messages out to the ones subscribed to any of the message's tags.
//!
//! The client registry is owned by [`Hub::run`] and never touched from any
//! other task. Everything else talks to the loop through a [`HubHandle`]:
//! registering, unregistering and broadcasting are messages on the loop's
//! channels, so they are applied in the order they are received.
//!
//! Each observer gets a bounded outbox. Delivery into it never blocks the
//! loop: a client whose outbox is full when a message arrives is closed and
//! dropped from the registry, and every other client still gets the message.

mod actor;
mod client;
mod listener;
mod pumps;
mod subscriptions;

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub use actor::{Hub, HubConfig, HubHandle};
pub use client::{Client, ClientId, Outbox};
pub use listener::{unsupported_command_reply, EventsListener};
pub use pumps::{serve, MessageCallback, PumpTimings, ServeOptions};
pub use subscriptions::{Subscriptions, DEFAULT_SUBSCRIPTIONS, WILDCARD};

/// Time allowed to write a frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next pong from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Keepalive ping period. Must be less than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum inbound payload size.
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// Default outbox (and inbox) capacity per client.
pub const DEFAULT_OUTBOX_CAPACITY: usize = MAX_MESSAGE_SIZE * 4;

/// Default capacity of the hub's broadcast intake.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 16;

/// Errors produced by the event hub and its clients.
#[derive(Error, Debug)]
pub enum HubError {
    /// The hub's control loop has stopped.
    #[error("event hub is stopped")]
    Stopped,

    /// The client's outbox has no room left.
    #[error("outbox full for client {0}")]
    OutboxFull(ClientId),

    /// The client has been closed.
    #[error("client {0} is closed")]
    ClientClosed(ClientId),

    /// WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to encode a reply.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Collapse newlines to spaces and trim surrounding whitespace.
///
/// Frames on the wire are newline-delimited, so a payload must never carry
/// its own newlines.
pub fn normalize_payload(payload: &[u8]) -> Bytes {
    let replaced: Vec<u8> = payload
        .iter()
        .map(|&b| if b == b'\n' { b' ' } else { b })
        .collect();
    let start = replaced
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(replaced.len());
    let end = replaced
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    Bytes::copy_from_slice(&replaced[start..end])
}
