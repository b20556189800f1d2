//! The hub's control loop and the handle used to drive it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    normalize_payload, Client, ClientId, HubError, Outbox, Subscriptions,
    DEFAULT_BROADCAST_CAPACITY, DEFAULT_OUTBOX_CAPACITY,
};

/// Capacity of the register, unregister and control channels.
const CONTROL_CAPACITY: usize = 64;

/// Hub sizing.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Outbox capacity per client.
    pub outbox_capacity: usize,
    /// Capacity of the broadcast intake.
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Registry entry for one client. Holds the only strong outbox sender.
struct ClientEntry {
    outbox: mpsc::Sender<Bytes>,
    subscriptions: Arc<Subscriptions>,
    closed: CancellationToken,
}

struct Registration {
    id: ClientId,
    entry: ClientEntry,
}

struct BroadcastMessage {
    payload: Bytes,
    tags: Vec<String>,
}

enum Control {
    UnregisterAll(oneshot::Sender<usize>),
    ClientCount(oneshot::Sender<usize>),
}

/// The hub actor. Owns the client registry.
pub struct Hub {
    clients: HashMap<ClientId, ClientEntry>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ClientId>,
    broadcast_rx: mpsc::Receiver<BroadcastMessage>,
    control_rx: mpsc::Receiver<Control>,
    stop: CancellationToken,
}

/// Cheap, clonable handle to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientId>,
    broadcast_tx: mpsc::Sender<BroadcastMessage>,
    control_tx: mpsc::Sender<Control>,
    stop: CancellationToken,
    outbox_capacity: usize,
}

impl Hub {
    /// Create a hub and its handle. Nothing happens until [`Hub::run`] is
    /// spawned.
    pub fn new(config: HubConfig) -> (Hub, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let stop = CancellationToken::new();

        let hub = Hub {
            clients: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            control_rx,
            stop: stop.clone(),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            control_tx,
            stop,
            outbox_capacity: config.outbox_capacity.max(1),
        };
        (hub, handle)
    }

    /// Run the control loop until [`HubHandle::stop`] is called, then close
    /// every client. A stopped hub cannot be restarted.
    pub async fn run(mut self) {
        tracing::info!("Event hub started");

        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,
                Some(registration) = self.register_rx.recv() => {
                    self.register(registration);
                }
                Some(id) = self.unregister_rx.recv() => {
                    self.close_client(&id);
                }
                Some(message) = self.broadcast_rx.recv() => {
                    self.fan_out(message);
                }
                Some(control) = self.control_rx.recv() => {
                    self.control(control);
                }
                else => break,
            }
        }

        self.shutdown();
    }

    fn register(&mut self, registration: Registration) {
        tracing::debug!(client_id = %registration.id, "Registered client");
        self.clients.insert(registration.id, registration.entry);
    }

    fn fan_out(&mut self, message: BroadcastMessage) {
        let mut evicted = Vec::new();

        for (id, entry) in &self.clients {
            if !entry.subscriptions.is_subscribed(&message.tags) {
                continue;
            }
            match entry.outbox.try_send(message.payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(client_id = %id, "Client outbox full, disconnecting");
                    evicted.push(id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(client_id = %id, "Client outbox closed");
                    evicted.push(id.clone());
                }
            }
        }

        for id in evicted {
            self.close_client(&id);
        }
    }

    fn control(&mut self, control: Control) {
        match control {
            Control::UnregisterAll(reply) => {
                let ids: Vec<ClientId> = self.clients.keys().cloned().collect();
                for id in &ids {
                    self.close_client(id);
                }
                tracing::info!(count = ids.len(), "Unregistered all clients");
                let _ = reply.send(ids.len());
            }
            Control::ClientCount(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }

    /// Remove a client if it is still registered. Dropping the entry drops
    /// the last strong outbox sender, which closes the outbox.
    fn close_client(&mut self, id: &ClientId) {
        if let Some(entry) = self.clients.remove(id) {
            entry.closed.cancel();
            tracing::debug!(client_id = %id, "Closed client");
        }
    }

    fn shutdown(&mut self) {
        self.register_rx.close();
        self.unregister_rx.close();
        self.broadcast_rx.close();
        self.control_rx.close();

        // Registrations queued before the stop already handed out a client.
        while let Ok(registration) = self.register_rx.try_recv() {
            self.register(registration);
        }

        let ids: Vec<ClientId> = self.clients.keys().cloned().collect();
        for id in &ids {
            self.close_client(id);
        }

        while let Ok(control) = self.control_rx.try_recv() {
            self.control(control);
        }
        while self.unregister_rx.try_recv().is_ok() {}
        while self.broadcast_rx.try_recv().is_ok() {}

        tracing::info!(closed = ids.len(), "Event hub stopped");
    }
}

impl HubHandle {
    /// Queue `payload` for every client subscribed to any of `tags`.
    ///
    /// The payload is normalized first (newlines become spaces, surrounding
    /// whitespace is trimmed). The intake is bounded: the call waits only
    /// while the intake already holds its full capacity of messages for the
    /// control loop, never on a slow client.
    pub async fn broadcast<I, S>(&self, payload: impl AsRef<[u8]>, tags: I) -> Result<(), HubError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.is_stopped() {
            return Err(HubError::Stopped);
        }
        let message = BroadcastMessage {
            payload: normalize_payload(payload.as_ref()),
            tags: tags.into_iter().map(Into::into).collect(),
        };
        self.broadcast_tx
            .send(message)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Register a new client subscribed to the default tags plus
    /// `subscriptions`.
    ///
    /// Returns the client and the receiving end of its outbox.
    pub async fn connect<I, S>(&self, subscriptions: I) -> Result<(Client, Outbox), HubError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.is_stopped() {
            return Err(HubError::Stopped);
        }

        let id = Uuid::new_v4().to_string();
        let subscriptions = Arc::new(Subscriptions::with_defaults(subscriptions));
        let (outbox_tx, outbox_rx) = mpsc::channel(self.outbox_capacity);
        let closed = CancellationToken::new();

        let client = Client::new(
            id.clone(),
            subscriptions.clone(),
            outbox_tx.downgrade(),
            closed.clone(),
            self.clone(),
        );
        let registration = Registration {
            id,
            entry: ClientEntry {
                outbox: outbox_tx,
                subscriptions,
                closed,
            },
        };

        self.register_tx
            .send(registration)
            .await
            .map_err(|_| HubError::Stopped)?;
        Ok((client, outbox_rx))
    }

    /// Ask the loop to remove a client. Unknown IDs are ignored.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.unregister_tx
            .send(id)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Remove every client and wait until the loop has done so.
    ///
    /// Returns the number of clients removed.
    pub async fn unregister_all(&self) -> Result<usize, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::UnregisterAll(reply_tx))
            .await
            .map_err(|_| HubError::Stopped)?;
        reply_rx.await.map_err(|_| HubError::Stopped)
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> Result<usize, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::ClientCount(reply_tx))
            .await
            .map_err(|_| HubError::Stopped)?;
        reply_rx.await.map_err(|_| HubError::Stopped)
    }

    /// Stop the loop. Every client is closed.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// True once [`HubHandle::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}
