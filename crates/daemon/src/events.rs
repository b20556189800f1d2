//! Publishing lifecycle events to observers.

use protocol::events::{EventRecord, GENERAL_TAG};
use protocol::ProtocolError;
use serde_json::Value;

use crate::hub::HubHandle;

/// Thin wrapper that serializes [`EventRecord`]s onto the hub.
///
/// Publishing is best effort: failures are logged and never returned, so a
/// stopped hub can never fail the operation that produced the event.
#[derive(Clone)]
pub struct EventEmitter {
    hub: HubHandle,
}

impl EventEmitter {
    /// Create an emitter backed by `hub`.
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }

    /// The hub this emitter publishes to.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Publish `record` under its routing tags.
    pub async fn emit(&self, record: EventRecord) {
        tracing::debug!(event = %record.event, app = ?record.app, "Event");
        let json = match record.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(event = %record.event, error = %e, "Failed to encode event");
                return;
            }
        };
        if let Err(e) = self.hub.broadcast(json, record.routing_tags()).await {
            tracing::debug!(event = %record.event, error = %e, "Event not published");
        }
    }

    /// Publish an externally produced JSON event.
    ///
    /// Routing tags are `extra_tags`, then the event's `app` (or `general`),
    /// then its own `tags`. The raw text is published unchanged. Text that is
    /// not a JSON object is rejected; a stopped hub is only logged.
    pub async fn forward(&self, raw: &str, extra_tags: &[String]) -> protocol::Result<()> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(fields) = value else {
            return Err(ProtocolError::Deserialization(
                "event is not a JSON object".to_string(),
            ));
        };

        let mut tags = extra_tags.to_vec();
        match fields.get("app").and_then(Value::as_str) {
            Some(app) => tags.push(app.to_string()),
            None => tags.push(GENERAL_TAG.to_string()),
        }
        if let Some(own) = fields.get("tags").and_then(Value::as_array) {
            tags.extend(own.iter().filter_map(Value::as_str).map(str::to_string));
        }

        if let Err(e) = self.hub.broadcast(raw, tags).await {
            tracing::debug!(error = %e, "Event not published");
        }
        Ok(())
    }

    /// Publish one trimmed line of console output for `app`.
    pub async fn console_log(&self, app: &str, label: &str, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.emit(
            EventRecord::new("console_log")
                .app(app)
                .field("programKey", label)
                .field("message", line),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubConfig, Outbox};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn setup(subscriptions: &[&str]) -> (EventEmitter, Outbox) {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());
        let (_client, outbox) = handle
            .connect(subscriptions.iter().map(|s| s.to_string()))
            .await
            .unwrap();
        (EventEmitter::new(handle), outbox)
    }

    async fn next_json(outbox: &mut Outbox) -> Value {
        let bytes = timeout(Duration::from_secs(1), outbox.recv())
            .await
            .expect("timeout")
            .expect("outbox closed");
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_emit_routes_by_app() {
        let (events, mut outbox) = setup(&["blog"]).await;

        events
            .emit(EventRecord::new("app_ready").app("api"))
            .await;
        events
            .emit(EventRecord::new("app_ready").app("blog"))
            .await;

        let value = next_json(&mut outbox).await;
        assert_eq!(value["app"], "blog");
        assert_eq!(value["event"], "app_ready");
    }

    #[tokio::test]
    async fn test_forward_uses_general_and_own_tags() {
        let (events, mut outbox) = setup(&["deploys"]).await;

        events
            .forward(r#"{"event":"server_started"}"#, &[])
            .await
            .unwrap();
        events
            .forward(r#"{"event":"pushed","tags":["deploys"]}"#, &[])
            .await
            .unwrap();

        let value = next_json(&mut outbox).await;
        assert_eq!(value["event"], "pushed");
    }

    #[tokio::test]
    async fn test_forward_rejects_garbage() {
        let (events, mut outbox) = setup(&["*"]).await;

        let extra = vec!["x".to_string()];
        assert!(matches!(
            events.forward("not json", &extra).await,
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(matches!(
            events.forward("[1, 2]", &extra).await,
            Err(ProtocolError::Deserialization(_))
        ));
        events.forward(r#"{"event":"ok"}"#, &[]).await.unwrap();

        let value = next_json(&mut outbox).await;
        assert_eq!(value["event"], "ok");
    }

    #[tokio::test]
    async fn test_console_log_trims_and_skips_blank() {
        let (events, mut outbox) = setup(&["blog"]).await;

        events.console_log("blog", "blog-rails", "   \r\n").await;
        events.console_log("blog", "blog-rails", "  Loading development environment\r\n").await;

        let value = next_json(&mut outbox).await;
        assert_eq!(value["event"], "console_log");
        assert_eq!(value["message"], "Loading development environment");
        assert_eq!(value["programKey"], "blog-rails");
    }
}
