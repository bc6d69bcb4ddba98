//! Read-model row shapes owned by the projection side. Command
//! handlers never write these.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::ProjectionError;
use crate::event::RecordedEvent;
use crate::keys::TenantId;

use super::{DELIVERY_STREAM_PREFIX, DeliveryEvent, DeliveryStatus};

/// Projector name embedded in every read-model key.
pub const DELIVERY_PROJECTOR: &str = "delivery";

/// One decoded event reduced to the field patch it contributes to
/// the row hash, plus everything the executor needs to build keys
/// and the version guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPatch {
    pub tenant: TenantId,
    pub entity_id: String,
    pub revision: u64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, String>,
}

impl RowPatch {
    /// Decode a committed delivery event into its row patch. The
    /// entity id is recovered from the stream name
    /// (`delivery-<tenant>-<id>`).
    pub fn from_recorded(event: &RecordedEvent) -> Result<Self, ProjectionError> {
        let tenant = event.metadata.tenant.clone();

        let stream_prefix = format!("{DELIVERY_STREAM_PREFIX}{tenant}-");
        let entity_id = event
            .stream_id
            .as_str()
            .strip_prefix(&stream_prefix)
            .ok_or_else(|| ProjectionError::MalformedStream {
                stream: event.stream_id.to_string(),
            })?
            .to_string();

        let domain_event =
            DeliveryEvent::from_recorded(event).map_err(|source| ProjectionError::Decode {
                event_type: event.event_type.clone(),
                revision: event.revision,
                source,
            })?;

        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), entity_id.clone());
        fields.insert("tenant".to_string(), tenant.to_string());
        fields.insert("version".to_string(), event.revision.to_string());
        fields.insert(
            "updated_at".to_string(),
            event.metadata.occurred_at.to_rfc3339(),
        );

        match &domain_event {
            DeliveryEvent::Requested { channel } => {
                fields.insert("status".into(), DeliveryStatus::Requested.as_str().into());
                fields.insert("channel".into(), channel.clone());
            }
            DeliveryEvent::Validated => {
                fields.insert("status".into(), DeliveryStatus::Validated.as_str().into());
            }
            DeliveryEvent::Queued => {
                fields.insert("status".into(), DeliveryStatus::Queued.as_str().into());
            }
            DeliveryEvent::Sent(detail) => {
                fields.insert("status".into(), DeliveryStatus::Sent.as_str().into());
                fields.insert("ts".into(), detail.ts.clone());
                fields.insert("channel".into(), detail.channel.clone());
                fields.insert("attempts".into(), detail.attempts.to_string());
            }
            DeliveryEvent::Failed(detail) => {
                fields.insert("status".into(), DeliveryStatus::Failed.as_str().into());
                fields.insert("reason".into(), detail.reason.clone());
                fields.insert("attempts".into(), detail.attempts.to_string());
                fields.insert("retryable".into(), detail.retryable.to_string());
                if let Some(last_error) = &detail.last_error {
                    fields.insert("last_error".into(), last_error.clone());
                }
            }
        }

        Ok(Self {
            tenant,
            entity_id,
            revision: event.revision,
            deleted_at: None,
            fields,
        })
    }

    /// A redaction patch: marks the row deleted at `deleted_at`. The
    /// executor routes this through the soft-delete branch, which
    /// keeps the row for audit but removes it from the tenant index.
    pub fn tombstone(
        tenant: TenantId,
        entity_id: impl Into<String>,
        revision: u64,
        deleted_at: DateTime<Utc>,
    ) -> Self {
        let entity_id = entity_id.into();

        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), entity_id.clone());
        fields.insert("tenant".to_string(), tenant.to_string());
        fields.insert("version".to_string(), revision.to_string());
        fields.insert("updated_at".to_string(), deleted_at.to_rfc3339());
        fields.insert("deleted_at".to_string(), deleted_at.to_rfc3339());

        Self {
            tenant,
            entity_id,
            revision,
            deleted_at: Some(deleted_at),
            fields,
        }
    }
}

/// The flattened read-model row as decoded from its stored field
/// map. Used by queries and tests; the executor itself only writes
/// patches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRow {
    pub id: String,
    pub tenant: String,
    pub status: DeliveryStatus,
    pub channel: Option<String>,
    pub ts: Option<String>,
    pub attempts: Option<u32>,
    pub reason: Option<String>,
    pub retryable: Option<bool>,
    pub last_error: Option<String>,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RowDecodeError {
    #[error("Row is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Row field {field} holds an unparseable value: {value}")]
    BadField { field: &'static str, value: String },
}

impl DeliveryRow {
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, RowDecodeError> {
        fn required<'a>(
            fields: &'a BTreeMap<String, String>,
            name: &'static str,
        ) -> Result<&'a str, RowDecodeError> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(RowDecodeError::MissingField(name))
        }

        fn parse<T: FromStr>(field: &'static str, value: &str) -> Result<T, RowDecodeError> {
            value.parse().map_err(|_| RowDecodeError::BadField {
                field,
                value: value.to_string(),
            })
        }

        let status = parse("status", required(fields, "status")?)?;
        let version = parse("version", required(fields, "version")?)?;

        let updated_at = fields
            .get("updated_at")
            .map(|value| parse::<DateTime<Utc>>("updated_at", value))
            .transpose()?;
        let deleted_at = fields
            .get("deleted_at")
            .map(|value| parse::<DateTime<Utc>>("deleted_at", value))
            .transpose()?;
        let attempts = fields
            .get("attempts")
            .map(|value| parse::<u32>("attempts", value))
            .transpose()?;
        let retryable = fields
            .get("retryable")
            .map(|value| parse::<bool>("retryable", value))
            .transpose()?;

        Ok(Self {
            id: required(fields, "id")?.to_string(),
            tenant: required(fields, "tenant")?.to_string(),
            status,
            channel: fields.get("channel").cloned(),
            ts: fields.get("ts").cloned(),
            attempts,
            reason: fields.get("reason").cloned(),
            retryable,
            last_error: fields.get("last_error").cloned(),
            version,
            updated_at,
            deleted_at,
        })
    }
}
