//! One observer connection registered with the hub.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{HubError, HubHandle, Subscriptions};

/// Unique identifier for a client.
pub type ClientId = String;

/// Receiving end of a client's outbox.
///
/// Yields `None` once the hub has closed the client.
pub type Outbox = mpsc::Receiver<Bytes>;

/// A handle to one registered observer.
///
/// The hub's registry entry holds the only strong sender into the outbox;
/// the client keeps a weak one. Removing the entry is therefore what closes
/// the outbox, and it can only happen once.
#[derive(Clone)]
pub struct Client {
    id: ClientId,
    subscriptions: Arc<Subscriptions>,
    outbox: mpsc::WeakSender<Bytes>,
    closed: CancellationToken,
    hub: HubHandle,
}

impl Client {
    pub(super) fn new(
        id: ClientId,
        subscriptions: Arc<Subscriptions>,
        outbox: mpsc::WeakSender<Bytes>,
        closed: CancellationToken,
        hub: HubHandle,
    ) -> Self {
        Self {
            id,
            subscriptions,
            outbox,
            closed,
            hub,
        }
    }

    /// Returns the client ID.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Add tags to this client's subscriptions.
    pub fn subscribe<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions.subscribe(names);
    }

    /// Remove tags from this client's subscriptions.
    pub fn unsubscribe<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.subscriptions.unsubscribe(names);
    }

    /// True if the client listens for any of `names` (or for everything).
    pub fn is_subscribed<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.subscriptions.is_subscribed(names)
    }

    /// Sorted snapshot of this client's tags.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.tags()
    }

    /// Queue `data` directly on this client's outbox without blocking.
    pub fn send(&self, data: impl Into<Bytes>, tag: &str) -> Result<(), HubError> {
        let Some(outbox) = self.outbox.upgrade() else {
            return Err(HubError::ClientClosed(self.id.clone()));
        };
        match outbox.try_send(data.into()) {
            Ok(()) => {
                tracing::trace!(client_id = %self.id, tag, "Queued direct message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(HubError::OutboxFull(self.id.clone())),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(HubError::ClientClosed(self.id.clone()))
            }
        }
    }

    /// Ask the hub to remove this client. Safe to call more than once.
    pub async fn close(&self) -> Result<(), HubError> {
        if self.is_closed() {
            return Ok(());
        }
        self.hub.unregister(self.id.clone()).await
    }

    /// True once the hub has removed this client.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the hub has removed this client.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("subscriptions", &self.subscriptions.tags())
            .field("closed", &self.is_closed())
            .finish()
    }
}
