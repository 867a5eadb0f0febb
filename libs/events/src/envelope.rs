//! Event envelope - the feed wrapper around a routing-update payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventError, RoutingUpdate};

/// A delivered event: feed position plus payload.
///
/// `event_id` is assigned by the feed, strictly increasing in delivery order,
/// and is the unit of acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Feed-assigned, monotonically increasing identifier.
    pub event_id: i64,

    /// When the plugin emitted the event, if the feed records it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,

    /// Event-specific payload.
    pub payload: P,
}

/// An envelope whose payload has not been decoded yet.
pub type RawEnvelope = EventEnvelope<serde_json::Value>;

impl<P> EventEnvelope<P> {
    pub fn new(event_id: i64, payload: P) -> Self {
        Self {
            event_id,
            occurred_at: None,
            payload,
        }
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }
}

impl RawEnvelope {
    /// Decode the payload into a validated [`RoutingUpdate`].
    pub fn decode(&self) -> Result<EventEnvelope<RoutingUpdate>, EventError> {
        let payload = RoutingUpdate::from_json(self.payload.clone())?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RoutingAction;

    #[test]
    fn test_raw_envelope_deserialization() {
        let raw: RawEnvelope = serde_json::from_value(serde_json::json!({
            "event_id": 42,
            "payload": {
                "action": "delete_application",
                "app_name": "blog",
                "namespace": "ns1"
            }
        }))
        .unwrap();

        assert_eq!(raw.event_id, 42);
        assert!(raw.occurred_at.is_none());

        let decoded = raw.decode().unwrap();
        assert_eq!(decoded.event_id, 42);
        assert_eq!(decoded.payload.action, RoutingAction::DeleteApplication);
    }

    #[test]
    fn test_decode_keeps_envelope_on_bad_payload() {
        let raw = RawEnvelope::new(7, serde_json::json!({"action": "add_gear"}));
        assert!(raw.decode().is_err());
        assert_eq!(raw.event_id, 7);
    }

    #[test]
    fn test_occurred_at_serialization() {
        let ts = "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let envelope = EventEnvelope::new(1, RoutingUpdate::create_application("blog", "ns1"))
            .occurred_at(ts);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["occurred_at"], "2024-05-01T12:00:00Z");
        assert_eq!(json["payload"]["action"], "create_application");
    }
}
