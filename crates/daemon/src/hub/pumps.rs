//! WebSocket read/write pumps for one client.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::{
    normalize_payload, Client, HubError, HubHandle, Outbox, DEFAULT_OUTBOX_CAPACITY,
    MAX_MESSAGE_SIZE, PING_PERIOD, PONG_WAIT, WRITE_WAIT,
};

/// Callback invoked for every inbound message once the client is registered.
///
/// Returning an error stops the listener for that client.
pub type MessageCallback = Arc<dyn Fn(&Client, Bytes) -> Result<(), HubError> + Send + Sync>;

/// Deadlines and keepalive interval used by the pumps.
#[derive(Debug, Clone, Copy)]
pub struct PumpTimings {
    /// Deadline for each frame write.
    pub write_wait: Duration,
    /// Read deadline, refreshed by every pong.
    pub pong_wait: Duration,
    /// Keepalive ping interval.
    pub ping_period: Duration,
}

impl Default for PumpTimings {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
        }
    }
}

/// Options for [`serve`].
#[derive(Clone, Default)]
pub struct ServeOptions {
    /// Tags subscribed on top of the defaults.
    pub subscriptions: Vec<String>,
    /// Optional handler for inbound messages.
    pub on_message: Option<MessageCallback>,
    /// Pump deadlines.
    pub timings: PumpTimings,
}

/// Register a WebSocket connection with the hub and start its pumps.
///
/// The write pump drains the outbox, the read pump reads inbound frames and
/// unregisters the client on any error, and when `on_message` is set a
/// listener task hands each inbound message to the callback.
pub async fn serve<S>(
    hub: &HubHandle,
    ws: WebSocketStream<S>,
    options: ServeOptions,
) -> Result<Client, HubError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, outbox) = hub.connect(options.subscriptions).await?;
    let (sink, stream) = ws.split();

    let inbox = match options.on_message {
        Some(callback) => {
            let (inbox_tx, inbox_rx) = mpsc::channel(DEFAULT_OUTBOX_CAPACITY);
            tokio::spawn(listen(client.clone(), inbox_rx, callback));
            Some(inbox_tx)
        }
        None => None,
    };

    tokio::spawn(write_pump(client.clone(), sink, outbox, options.timings));
    tokio::spawn(read_pump(client.clone(), stream, inbox, options.timings));

    tracing::info!(
        client_id = %client.id(),
        subscriptions = ?client.subscriptions(),
        "Observer connected"
    );
    Ok(client)
}

/// Drain the outbox into the socket, coalescing queued messages into one
/// newline-separated frame, and ping on a fixed interval.
async fn write_pump<K>(client: Client, mut sink: K, mut outbox: Outbox, timings: PumpTimings)
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut ticker = interval_at(Instant::now() + timings.ping_period, timings.ping_period);

    loop {
        tokio::select! {
            message = outbox.recv() => {
                let Some(first) = message else {
                    // The hub closed the outbox.
                    let _ = timeout(timings.write_wait, sink.send(Message::Close(None))).await;
                    break;
                };

                let mut frame = first.to_vec();
                for _ in 0..outbox.len() {
                    match outbox.try_recv() {
                        Ok(next) => {
                            frame.push(b'\n');
                            frame.extend_from_slice(&next);
                        }
                        Err(_) => break,
                    }
                }

                let text = String::from_utf8_lossy(&frame).into_owned();
                if let Err(e) = write_frame(&mut sink, Message::Text(text), timings.write_wait).await {
                    tracing::debug!(client_id = %client.id(), error = %e, "Write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = write_frame(&mut sink, Message::Ping(Vec::new()), timings.write_wait).await {
                    tracing::debug!(client_id = %client.id(), error = %e, "Ping failed");
                    break;
                }
            }
        }
    }

    let _ = client.close().await;
    let _ = timeout(timings.write_wait, sink.close()).await;
    tracing::debug!(client_id = %client.id(), "Write pump stopped");
}

async fn write_frame<K>(sink: &mut K, message: Message, deadline: Duration) -> Result<(), HubError>
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    match timeout(deadline, sink.send(message)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HubError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}

/// Read frames until the peer goes away, a deadline passes or the hub
/// closes the client, then unregister.
async fn read_pump<R>(
    client: Client,
    mut stream: R,
    inbox: Option<mpsc::Sender<Bytes>>,
    timings: PumpTimings,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let deadline = sleep(timings.pong_wait);
    tokio::pin!(deadline);

    loop {
        let payload = tokio::select! {
            _ = client.closed() => break,
            _ = &mut deadline => {
                tracing::debug!(client_id = %client.id(), "Read deadline exceeded");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Pong(_))) => {
                    deadline.as_mut().reset(Instant::now() + timings.pong_wait);
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(client_id = %client.id(), error = %e, "Read failed");
                    break;
                }
            },
        };

        if payload.len() > MAX_MESSAGE_SIZE {
            tracing::warn!(
                client_id = %client.id(),
                size = payload.len(),
                max = MAX_MESSAGE_SIZE,
                "Inbound message too large"
            );
            break;
        }

        let message = normalize_payload(&payload);
        match &inbox {
            Some(inbox) => {
                if inbox.send(message).await.is_err() {
                    tracing::debug!(client_id = %client.id(), "Listener gone, dropping message");
                }
            }
            None => {
                tracing::warn!(
                    client_id = %client.id(),
                    payload = %String::from_utf8_lossy(&message),
                    "Received unexpected payload"
                );
            }
        }
    }

    // Dropping the inbox sender ends the listener.
    drop(inbox);
    let _ = client.close().await;
    tracing::debug!(client_id = %client.id(), "Read pump stopped");
}

/// Hand inbound messages to the callback until the inbox closes.
async fn listen(client: Client, mut inbox: mpsc::Receiver<Bytes>, callback: MessageCallback) {
    loop {
        let Some(message) = inbox.recv().await else {
            tracing::debug!(client_id = %client.id(), "Connection closed");
            return;
        };
        if let Err(e) = callback(&client, message) {
            tracing::debug!(client_id = %client.id(), error = %e, "Message callback failed");
            return;
        }
    }
}
