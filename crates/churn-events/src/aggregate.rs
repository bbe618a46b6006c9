use serde::Serialize;

use crate::{AuditEvent, EventKind};

/// Per-client summary computed from the stored audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientAggregate {
    pub client_id: String,
    pub connect_count: u64,
    pub disconnect_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_event: Option<AuditEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<EventKind>,
}

impl ClientAggregate {
    pub fn empty(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Count CONNECT/DISCONNECT and pick the newest event as current status.
    /// Events belonging to other clients are ignored.
    pub fn from_events(client_id: &str, events: &[AuditEvent]) -> Self {
        let mut agg = Self::empty(client_id);
        let mine = events.iter().filter(|ev| ev.client_id == client_id);
        for ev in mine.clone() {
            match ev.event_type {
                EventKind::Connect => agg.connect_count += 1,
                EventKind::Disconnect => agg.disconnect_count += 1,
                _ => {}
            }
        }
        // max_by_key keeps the last of equal timestamps, i.e. the latest write
        agg.latest_event = mine.max_by_key(|ev| ev.timestamp).cloned();
        agg.current_status = agg.latest_event.as_ref().map(|ev| ev.event_type);
        agg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(client: &str, ts: i64, kind: EventKind) -> AuditEvent {
        AuditEvent {
            client_id: client.to_string(),
            timestamp: ts,
            event_type: kind,
            message: String::new(),
            topic: "t".to_string(),
        }
    }

    #[test]
    fn empty_trail_is_zeroed() {
        let agg = ClientAggregate::from_events("ClientA1", &[]);
        assert_eq!(agg.connect_count, 0);
        assert_eq!(agg.disconnect_count, 0);
        assert!(agg.latest_event.is_none());
        assert!(agg.current_status.is_none());
    }

    #[test]
    fn counts_and_latest_status() {
        let events = vec![
            ev("ClientA1", 10, EventKind::Connect),
            ev("ClientA1", 12, EventKind::Publish),
            ev("ClientB2", 99, EventKind::Connect),
            ev("ClientA1", 15, EventKind::Disconnect),
            ev("ClientA1", 11, EventKind::Connect),
        ];
        let agg = ClientAggregate::from_events("ClientA1", &events);
        assert_eq!(agg.connect_count, 2);
        assert_eq!(agg.disconnect_count, 1);
        assert_eq!(agg.current_status, Some(EventKind::Disconnect));
        assert_eq!(agg.latest_event.map(|e| e.timestamp), Some(15));
    }
}
