use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::AuditEvent;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Durable, append-only audit store.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event. Not idempotent; a retried write may duplicate.
    async fn put_event(&self, event: &AuditEvent) -> Result<(), StoreError>;
    /// All events recorded for `client_id`, in no particular order.
    async fn query_client(&self, client_id: &str) -> Result<Vec<AuditEvent>, StoreError>;
}

/// In-memory store for single-process runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<AuditEvent>>,
    fail_puts: AtomicUsize,
    fail_queries: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, on: bool) {
        self.fail_queries.store(on, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    async fn put_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let injected = self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    async fn query_client(&self, client_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected query failure".into()));
        }
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .filter(|ev| ev.client_id == client_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, EventKind};

    #[tokio::test]
    async fn query_filters_by_client() {
        let store = MemoryStore::new();
        let a = ClientId::new("ClientA1");
        let b = ClientId::new("ClientB2");
        store
            .put_event(&AuditEvent::new(&a, EventKind::Connect, "", "x"))
            .await
            .unwrap();
        store
            .put_event(&AuditEvent::new(&b, EventKind::Connect, "", "x"))
            .await
            .unwrap();
        let rows = store.query_client("ClientA1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client_id, "ClientA1");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        let id = ClientId::new("ClientA1");
        let ev = AuditEvent::new(&id, EventKind::Disconnect, "", "x");
        store.fail_next_puts(1);
        assert!(store.put_event(&ev).await.is_err());
        assert!(store.put_event(&ev).await.is_ok());
        assert_eq!(store.len().await, 1);

        store.fail_queries(true);
        assert!(store.query_client("ClientA1").await.is_err());
    }
}
