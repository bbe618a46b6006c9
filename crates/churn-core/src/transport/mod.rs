use std::time::Duration;

use tokio::sync::broadcast;

mod local;
#[cfg(feature = "nats")]
pub mod nats;

pub use local::{LocalBroker, LocalTransport};
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

/// Capacity of each transport's callback channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Result code reported for a clean connect or disconnect.
pub const CODE_OK: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub client_id: String,
}

/// Callbacks pushed by the transport, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { code: i32 },
    Message { topic: String, payload: Vec<u8> },
    /// `None` when the transport could not tell why the link went away.
    Disconnected { code: Option<i32> },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connection refused (code {0})")]
    Refused(i32),
    #[error("reconnect requested before any connect")]
    NeverConnected,
    #[error("transport error: {0}")]
    Other(String),
}

/// Opaque publish/subscribe capability over a single broker connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, opts: &ConnectOptions) -> Result<(), TransportError>;
    /// Re-establish the link with the options of the last `connect`.
    async fn reconnect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    /// Subscribe to callbacks. Only events sent after this call are observed.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
