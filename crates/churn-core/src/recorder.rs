use std::sync::Arc;

use churn_events::{
    AuditEvent, ClientAggregate, ClientId, EventKind, EventStore, StoreError, AUDIT_LOG_TARGET,
};
use tracing::{info, warn};

use crate::transport::Transport;

/// Builds audit events and delivers them.
///
/// Two delivery paths exist: [`EventRecorder::record`] mirrors the event onto
/// the broker's log topic and appends it to the store, while
/// [`EventRecorder::persist`] writes straight to the store for the moments the
/// connection is known to be gone. Neither assumes a live connection.
pub struct EventRecorder {
    client_id: ClientId,
    transport: Arc<dyn Transport>,
    store: Arc<dyn EventStore>,
    log_topic: String,
}

impl EventRecorder {
    pub fn new(
        client_id: ClientId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn EventStore>,
        log_topic: impl Into<String>,
    ) -> Self {
        Self {
            client_id,
            transport,
            store,
            log_topic: log_topic.into(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn log_topic(&self) -> &str {
        &self.log_topic
    }

    /// Stamp a new event with this client's id and the current time.
    pub fn event(&self, kind: EventKind, message: impl Into<String>, topic: &str) -> AuditEvent {
        AuditEvent::new(&self.client_id, kind, message, topic)
    }

    /// Mirror delivery. Failures on either leg are logged and swallowed.
    pub async fn record(
        &self,
        kind: EventKind,
        message: impl Into<String>,
        topic: &str,
    ) -> AuditEvent {
        let event = self.event(kind, message, topic);
        match event.to_json() {
            Ok(bytes) => {
                if let Err(err) = self.transport.publish(&self.log_topic, bytes).await {
                    warn!(
                        target: "churn::recorder",
                        kind = %kind,
                        log_topic = %self.log_topic,
                        error = %err,
                        "audit mirror publish failed"
                    );
                }
            }
            Err(err) => {
                warn!(
                    target: "churn::recorder",
                    kind = %kind,
                    error = %err,
                    "audit event encode failed"
                );
            }
        }
        if let Err(err) = self.store.put_event(&event).await {
            warn!(
                target: "churn::recorder",
                kind = %kind,
                error = %err,
                "audit store write failed"
            );
        }
        log_event(&event);
        event
    }

    /// Direct delivery: one store write, no broker involvement.
    pub async fn persist(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.store.put_event(event).await?;
        log_event(event);
        Ok(())
    }

    /// Direct delivery retried exactly once with the same event.
    /// Returns whether the event reached the store.
    pub async fn persist_retrying_once(&self, event: &AuditEvent) -> bool {
        let first = match self.persist(event).await {
            Ok(()) => return true,
            Err(err) => err,
        };
        warn!(
            target: "churn::recorder",
            kind = %event.event_type,
            error = %first,
            "audit store write failed; retrying once"
        );
        match self.persist(event).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target: "churn::recorder",
                    kind = %event.event_type,
                    error = %err,
                    "audit store retry failed; event dropped"
                );
                false
            }
        }
    }

    /// Connect/disconnect counts and current status for `client_id`.
    /// Query failures degrade to a zeroed aggregate.
    pub async fn query_aggregate(&self, client_id: &str) -> ClientAggregate {
        match self.store.query_client(client_id).await {
            Ok(events) => ClientAggregate::from_events(client_id, &events),
            Err(err) => {
                warn!(
                    target: "churn::recorder",
                    client = %client_id,
                    error = %err,
                    "aggregate query failed"
                );
                ClientAggregate::empty(client_id)
            }
        }
    }
}

fn log_event(event: &AuditEvent) {
    info!(
        target: AUDIT_LOG_TARGET,
        client = %event.client_id,
        kind = %event.event_type,
        topic = %event.topic,
        timestamp = event.timestamp,
        "{}",
        event.message
    );
}
