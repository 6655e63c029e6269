use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Change that affects a profile's cache state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// An outbound message was sent
    SendRecorded {
        location_id: String,
        from_number: String,
        /// First send to this recipient in the local day
        #[serde(default)]
        is_first_contact_today: bool,
    },

    /// A pending number request got its number
    NumberRequestFulfilled {
        request_id: String,
        location_id: String,
        phone_number: String,
    },
}

impl EventKind {
    /// Label used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendRecorded { .. } => "send_recorded",
            Self::NumberRequestFulfilled { .. } => "number_request_fulfilled",
        }
    }
}

/// Event envelope published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub profile_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl CacheEvent {
    pub fn send_recorded(
        profile_id: impl Into<String>,
        location_id: impl Into<String>,
        from_number: impl Into<String>,
        is_first_contact_today: bool,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            kind: EventKind::SendRecorded {
                location_id: location_id.into(),
                from_number: from_number.into(),
                is_first_contact_today,
            },
        }
    }

    pub fn number_request_fulfilled(
        profile_id: impl Into<String>,
        request_id: impl Into<String>,
        location_id: impl Into<String>,
        phone_number: impl Into<String>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            kind: EventKind::NumberRequestFulfilled {
                request_id: request_id.into(),
                location_id: location_id.into(),
                phone_number: phone_number.into(),
            },
        }
    }
}

/// Cache event bus
///
/// Uses a broadcast channel so every attached profile subscription sees every
/// event and keeps only its own.
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    /// Publish an event. Returns the number of receivers it reached.
    pub fn publish(&self, event: CacheEvent) -> usize {
        debug!(
            profile_id = %event.profile_id,
            kind = event.kind.name(),
            "publishing cache event"
        );
        // No subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_fans_out() {
        let bus = EventBus::new(16);

        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let event = CacheEvent::send_recorded("p1", "loc-a", "+15550001", true);
        assert_eq!(bus.publish(event.clone()), 2);

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            bus.publish(CacheEvent::send_recorded("p1", "l", "+1", false)),
            0
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = CacheEvent::number_request_fulfilled("p1", "req-1", "loc-a", "+15550010");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "number_request_fulfilled");
        assert_eq!(json["profile_id"], "p1");
        assert_eq!(json["phone_number"], "+15550010");

        let decoded: CacheEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
    }
}
