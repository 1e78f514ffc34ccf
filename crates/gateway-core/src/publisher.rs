use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::pubsub::PubSub;

const TOPIC: &str = "gateway-events";

#[derive(Serialize)]
struct Envelope<'a, T> {
    t: &'a str,
    d: T,
}

/// The only write path into `gateway-events`. Callers outside the gateway
/// (message creation, member joins, role edits) publish through this so
/// every Hub instance picks the event up and fans it out to connections.
pub struct EventPublisher {
    bus: Arc<dyn PubSub>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self { bus }
    }

    pub async fn publish<T: Serialize>(&self, event_type: &str, payload: T) -> Result<()> {
        let envelope = Envelope { t: event_type, d: payload };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| crate::error::GatewayError::Fatal(format!("event payload not serializable: {e}")))?;
        self.bus.publish(TOPIC, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::InMemoryPubSub;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn publish_wraps_payload_with_event_type() {
        let bus = Arc::new(InMemoryPubSub::new());
        let publisher = EventPublisher::new(bus.clone());
        let mut sub = bus.subscribe(TOPIC).await.unwrap();

        publisher.publish("message_create", json!({"id": "m1"})).await.unwrap();

        let raw = sub.next().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["t"], "message_create");
        assert_eq!(value["d"]["id"], "m1");
    }
}
