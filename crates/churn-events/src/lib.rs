use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

mod aggregate;
mod store;

pub use aggregate::ClientAggregate;
pub use store::{EventStore, MemoryStore, StoreError};

/// `tracing` target for one line per recorded audit event.
pub const AUDIT_LOG_TARGET: &str = "churn::audit";

/// Lifecycle or action transition recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    Publish,
    Receive,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "CONNECT",
            EventKind::Disconnect => "DISCONNECT",
            EventKind::Subscribe => "SUBSCRIBE",
            EventKind::Unsubscribe => "UNSUBSCRIBE",
            EventKind::Publish => "PUBLISH",
            EventKind::Receive => "RECEIVE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CONNECT" => Some(EventKind::Connect),
            "DISCONNECT" => Some(EventKind::Disconnect),
            "SUBSCRIBE" => Some(EventKind::Subscribe),
            "UNSUBSCRIBE" => Some(EventKind::Unsubscribe),
            "PUBLISH" => Some(EventKind::Publish),
            "RECEIVE" => Some(EventKind::Receive),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of this process for the whole run; keys every audit event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `Client` followed by an uppercase letter and a digit 1-9, e.g. `ClientK7`.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let letter = char::from(b'A' + rng.random_range(0..26u8));
        let digit = rng.random_range(1..=9u8);
        Self(format!("Client{letter}{digit}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable audit record; this is also the JSON wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub client_id: String,
    /// Epoch seconds.
    pub timestamp: i64,
    pub event_type: EventKind,
    pub message: String,
    pub topic: String,
}

impl AuditEvent {
    pub fn new(
        client_id: &ClientId,
        kind: EventKind,
        message: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.as_str().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            event_type: kind,
            message: message.into(),
            topic: topic.into(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
