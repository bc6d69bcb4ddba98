use serde::{Deserialize, Serialize};

use crate::event::{EventMetadata, NewEvent, RecordedEvent};

use super::{FailureDetail, SentDetail};

/// Facts committed for one delivery request. Adjacently tagged so
/// the `type` field becomes the store-level event type and `data`
/// the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum DeliveryEvent {
    Requested { channel: String },
    Validated,
    Queued,
    Sent(SentDetail),
    Failed(FailureDetail),
}

impl DeliveryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Requested { .. } => "Requested",
            Self::Validated => "Validated",
            Self::Queued => "Queued",
            Self::Sent(_) => "Sent",
            Self::Failed(_) => "Failed",
        }
    }

    /// Convert to the store's wire shape. The tagged serialization
    /// splits into `event_type` plus raw `data`.
    pub fn to_new_event(&self, metadata: EventMetadata) -> Result<NewEvent, serde_json::Error> {
        let tagged = serde_json::to_value(self)?;

        let data = tagged
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        Ok(NewEvent {
            event_type: self.event_type().to_string(),
            data,
            metadata,
        })
    }

    /// Rebuild the domain event from a committed store event.
    pub fn from_recorded(event: &RecordedEvent) -> Result<Self, serde_json::Error> {
        let tagged = if event.data.is_null() {
            serde_json::json!({ "type": event.event_type })
        } else {
            serde_json::json!({ "type": event.event_type, "data": event.data })
        };

        serde_json::from_value(tagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{StreamId, StreamPosition};
    use crate::keys::TenantId;

    fn metadata() -> EventMetadata {
        EventMetadata::new(TenantId::new("t1").unwrap())
    }

    fn recorded(new_event: NewEvent) -> RecordedEvent {
        RecordedEvent {
            stream_id: StreamId::new("delivery", "t1-r1"),
            revision: 1,
            position: StreamPosition(1),
            event_type: new_event.event_type,
            data: new_event.data,
            metadata: new_event.metadata,
        }
    }

    #[test]
    fn sent_event_roundtrips_through_the_wire_shape() {
        let event = DeliveryEvent::Sent(SentDetail {
            ts: "100.1".into(),
            channel: "#c".into(),
            attempts: 1,
        });

        let new_event = event.to_new_event(metadata()).unwrap();
        assert_eq!(new_event.event_type, "Sent");
        assert_eq!(new_event.data["ts"], "100.1");

        let decoded = DeliveryEvent::from_recorded(&recorded(new_event)).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn fieldless_event_has_null_data() {
        let new_event = DeliveryEvent::Validated.to_new_event(metadata()).unwrap();

        assert_eq!(new_event.event_type, "Validated");
        assert!(new_event.data.is_null());

        let decoded = DeliveryEvent::from_recorded(&recorded(new_event)).unwrap();
        assert_eq!(decoded, DeliveryEvent::Validated);
    }

    #[test]
    fn unknown_event_type_fails_to_decode() {
        let mut new_event = DeliveryEvent::Queued.to_new_event(metadata()).unwrap();
        new_event.event_type = "Repudiated".into();

        assert!(DeliveryEvent::from_recorded(&recorded(new_event)).is_err());
    }

    #[test]
    fn failed_event_carries_the_full_failure_detail() {
        let event = DeliveryEvent::Failed(FailureDetail {
            reason: "rate_limited".into(),
            attempts: 3,
            retryable: true,
            last_error: Some("429 Too Many Requests".into()),
        });

        let new_event = event.to_new_event(metadata()).unwrap();
        assert_eq!(new_event.data["reason"], "rate_limited");
        assert_eq!(new_event.data["retryable"], true);

        let decoded = DeliveryEvent::from_recorded(&recorded(new_event)).unwrap();
        assert_eq!(decoded, event);
    }
}
