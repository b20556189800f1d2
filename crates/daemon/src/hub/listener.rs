//! TCP endpoint that upgrades observer connections and hands them to the hub.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use protocol::events::{EventRecord, ERRORS_TAG};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use url::form_urlencoded;

use super::{
    serve, Client, HubError, HubHandle, MessageCallback, ServeOptions, MAX_MESSAGE_SIZE, WILDCARD,
};

/// Query parameter carrying a comma-separated list of tags.
const SUBSCRIBE_PARAM: &str = "subscribe";

/// Accepts observer connections on a TCP socket.
pub struct EventsListener {
    listener: TcpListener,
    hub: HubHandle,
}

impl EventsListener {
    /// Bind to `addr`.
    pub async fn bind(addr: SocketAddr, hub: HubHandle) -> Result<Self, HubError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Events listener bound");
        Ok(Self { listener, hub })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, HubError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = self.hub.clone();
                        tokio::spawn(async move {
                            if let Err(e) = accept_observer(&hub, stream).await {
                                tracing::debug!(peer = %peer, error = %e, "Observer handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept observer connection");
                    }
                },
            }
        }
        tracing::info!("Events listener stopped");
    }
}

/// Upgrade one TCP connection and register it with the hub.
async fn accept_observer(hub: &HubHandle, stream: TcpStream) -> Result<Client, HubError> {
    let mut query: Option<String> = None;
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        query = request.uri().query().map(str::to_owned);
        Ok(response)
    };

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);

    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, capture, Some(config)).await?;

    let subscriptions = query
        .as_deref()
        .and_then(parse_subscriptions)
        .unwrap_or_else(|| vec![WILDCARD.to_string()]);

    let callback: MessageCallback = Arc::new(unsupported_command_reply);
    serve(
        hub,
        ws,
        ServeOptions {
            subscriptions,
            on_message: Some(callback),
            ..Default::default()
        },
    )
    .await
}

/// Read `subscribe=a,b` from a query string. `None` when absent or empty.
fn parse_subscriptions(query: &str) -> Option<Vec<String>> {
    let (_, value) =
        form_urlencoded::parse(query.as_bytes()).find(|(key, _)| key == SUBSCRIBE_PARAM)?;

    let tags: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    (!tags.is_empty()).then_some(tags)
}

/// Answer any inbound command with an `errors`-tagged reply: observers may
/// only listen.
pub fn unsupported_command_reply(client: &Client, message: Bytes) -> Result<(), HubError> {
    tracing::debug!(
        client_id = %client.id(),
        message = %String::from_utf8_lossy(&message),
        "Rejecting inbound observer command"
    );
    let reply = EventRecord::new("error")
        .tag(ERRORS_TAG)
        .field("message", "incoming websocket messages unsupported");
    client.send(reply.to_json()?, ERRORS_TAG)
}
