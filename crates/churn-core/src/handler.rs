use std::sync::Arc;
use std::time::Duration;

use churn_events::{AuditEvent, EventKind};
use churn_topics::TopicUniverse;
use serde_json::Value;
use tracing::{debug, trace};

use crate::recorder::EventRecorder;

/// Pull the human text out of an inbound payload.
///
/// A JSON object's `"message"` field wins; anything else (invalid JSON, a
/// non-object, a missing field) falls back to the raw payload as text.
pub fn extract_message(payload: &[u8]) -> String {
    let raw = || String::from_utf8_lossy(payload).into_owned();
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => match map.get("message") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => raw(),
        },
        _ => raw(),
    }
}

/// Mirrors traffic on topics of interest into the audit trail.
pub struct MessageHandler {
    recorder: Arc<EventRecorder>,
    universe: Arc<TopicUniverse>,
    pacing: Duration,
}

impl MessageHandler {
    pub fn new(
        recorder: Arc<EventRecorder>,
        universe: Arc<TopicUniverse>,
        pacing: Duration,
    ) -> Self {
        Self {
            recorder,
            universe,
            pacing,
        }
    }

    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> Option<AuditEvent> {
        if !self.universe.contains(topic) {
            trace!(target: "churn::handler", topic, "message outside topic universe dropped");
            return None;
        }
        let text = extract_message(payload);
        if text.trim().is_empty() {
            debug!(target: "churn::handler", topic, "empty message dropped");
            return None;
        }
        let event = self.recorder.record(EventKind::Receive, text, topic).await;
        tokio::time::sleep(self.pacing).await;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalBroker, Transport};
    use churn_events::{ClientId, MemoryStore};

    #[test]
    fn extracts_message_field_or_falls_back() {
        assert_eq!(extract_message(br#"{"message":"hello"}"#), "hello");
        assert_eq!(extract_message(br#"{"message":42}"#), "42");
        assert_eq!(extract_message(br#"{"other":"x"}"#), r#"{"other":"x"}"#);
        assert_eq!(extract_message(br#"["message"]"#), r#"["message"]"#);
        assert_eq!(extract_message(b"plain text"), "plain text");
        assert_eq!(extract_message(b"{broken"), "{broken");
    }

    async fn handler() -> (Arc<MemoryStore>, MessageHandler) {
        let broker = LocalBroker::new();
        let transport: Arc<dyn Transport> = Arc::new(broker.transport().await);
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(EventRecorder::new(
            ClientId::new("ClientH2"),
            transport,
            store.clone(),
            "connection/logs",
        ));
        let universe = Arc::new(TopicUniverse::from_topics(vec![
            "home/garage/motion".into(),
        ]));
        let handler = MessageHandler::new(recorder, universe, Duration::from_millis(1000));
        (store, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn receive_only_for_known_topics_with_text() {
        let (store, h) = handler().await;
        let outside = h.on_message("other/topic/x", br#"{"message":"hi"}"#).await;
        assert!(outside.is_none());
        let blank = h.on_message("home/garage/motion", br#"{"message":"  "}"#).await;
        assert!(blank.is_none());
        assert!(h.on_message("home/garage/motion", b"\n\t").await.is_none());
        assert!(store.is_empty().await);

        let ev = h
            .on_message("home/garage/motion", br#"{"message":"abcde"}"#)
            .await
            .unwrap();
        assert_eq!(ev.event_type, EventKind::Receive);
        assert_eq!(ev.message, "abcde");
        assert_eq!(ev.topic, "home/garage/motion");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_applies_pacing_delay() {
        let (_store, h) = handler().await;
        let started = tokio::time::Instant::now();
        h.on_message("home/garage/motion", b"raw").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1000));

        let started = tokio::time::Instant::now();
        h.on_message("nope", b"raw").await;
        assert!(started.elapsed() < Duration::from_millis(1000));
    }
}
