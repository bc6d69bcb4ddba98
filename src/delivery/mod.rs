//! The delivery-request aggregate: the authoritative state machine
//! for one outbound notification.
//!
//! State is rebuilt by folding committed events; commands validate
//! against the current state and emit at most one new event. Status
//! only moves forward. `Sent` and `Failed` are terminal, and the
//! only accepted command against a terminal state is an exact repeat
//! of the one that produced it, which is a successful no-op.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::keys::TenantId;

mod cmd;
mod event;
mod view;

pub use cmd::{
    CallerContext, DELIVERY_STREAM_PREFIX, DeliveryCommandService, MarkQueued, MarkValidated,
    RecordFailed, RecordSent, RequestDelivery, delivery_stream,
};
pub use event::DeliveryEvent;
pub use view::{DELIVERY_PROJECTOR, DeliveryRow, RowPatch};

/// Typed aggregate identifier. String IDs at the store boundary
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(Uuid);

impl DeliveryId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeliveryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Requested,
    Validated,
    Queued,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Validated => "validated",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "validated" => Ok(Self::Validated),
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown delivery status: {0}")]
pub struct UnknownStatusError(String);

/// Everything needed to rebuild a successful delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SentDetail {
    /// Provider-assigned message identifier (e.g. a channel message
    /// timestamp).
    pub ts: String,
    pub channel: String,
    pub attempts: u32,
}

/// Everything needed to rebuild a failed delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetail {
    /// Normalized provider reason code.
    pub reason: String,
    pub attempts: u32,
    pub retryable: bool,
    pub last_error: Option<String>,
}

/// Command rejections: the requested transition conflicts with the
/// current state. Final: retrying the same command cannot succeed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("Delivery already recorded as sent; cannot record a failure")]
    AlreadySent,

    #[error("Delivery already recorded as failed; cannot record a success")]
    AlreadyFailed,

    #[error("Delivery already terminal as {status:?} with different detail")]
    TerminalDetailMismatch { status: DeliveryStatus },

    #[error("Status cannot move backwards from {from:?} to {to:?}")]
    StatusRegression {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
}

/// The aggregate root. `version` is the revision of the last applied
/// event and increases by exactly one per committed event; the
/// genesis `Requested` event is revision 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub id: DeliveryId,
    pub tenant: TenantId,
    pub channel: String,
    pub status: DeliveryStatus,
    pub sent: Option<SentDetail>,
    pub failure: Option<FailureDetail>,
    pub version: u64,
}

impl DeliveryRequest {
    /// Create a fresh aggregate, returning it with its genesis
    /// event. The caller appends the event with an expected revision
    /// of "no stream".
    pub fn request(id: DeliveryId, tenant: TenantId, channel: String) -> (Self, DeliveryEvent) {
        let aggregate = Self {
            id,
            tenant,
            channel: channel.clone(),
            status: DeliveryStatus::Requested,
            sent: None,
            failure: None,
            version: 0,
        };

        (aggregate, DeliveryEvent::Requested { channel })
    }

    /// Rebuild state from full committed history. Returns `None` for
    /// an empty history or one that does not begin with `Requested`.
    pub fn reconstitute(id: DeliveryId, tenant: TenantId, history: &[DeliveryEvent]) -> Option<Self> {
        let mut events = history.iter();

        let DeliveryEvent::Requested { channel } = events.next()? else {
            return None;
        };

        let mut aggregate = Self {
            id,
            tenant,
            channel: channel.clone(),
            status: DeliveryStatus::Requested,
            sent: None,
            failure: None,
            version: 0,
        };

        for event in events {
            aggregate.apply(event);
        }

        Some(aggregate)
    }

    /// Resume from a serialized snapshot plus the events committed
    /// after it.
    pub fn from_snapshot(snapshot: Self, subsequent: &[DeliveryEvent]) -> Self {
        let mut aggregate = snapshot;
        for event in subsequent {
            aggregate.apply(event);
        }
        aggregate
    }

    pub fn mark_validated(&mut self) -> Result<Option<DeliveryEvent>, InvariantViolation> {
        match self.status {
            DeliveryStatus::Requested => {
                let event = DeliveryEvent::Validated;
                self.apply(&event);
                Ok(Some(event))
            }
            DeliveryStatus::Validated => Ok(None),
            DeliveryStatus::Queued => Err(InvariantViolation::StatusRegression {
                from: DeliveryStatus::Queued,
                to: DeliveryStatus::Validated,
            }),
            DeliveryStatus::Sent => Err(InvariantViolation::AlreadySent),
            DeliveryStatus::Failed => Err(InvariantViolation::AlreadyFailed),
        }
    }

    pub fn mark_queued(&mut self) -> Result<Option<DeliveryEvent>, InvariantViolation> {
        match self.status {
            DeliveryStatus::Requested | DeliveryStatus::Validated => {
                let event = DeliveryEvent::Queued;
                self.apply(&event);
                Ok(Some(event))
            }
            DeliveryStatus::Queued => Ok(None),
            DeliveryStatus::Sent => Err(InvariantViolation::AlreadySent),
            DeliveryStatus::Failed => Err(InvariantViolation::AlreadyFailed),
        }
    }

    pub fn mark_sent(
        &mut self,
        detail: SentDetail,
    ) -> Result<Option<DeliveryEvent>, InvariantViolation> {
        match self.status {
            DeliveryStatus::Sent => {
                if self.sent.as_ref() == Some(&detail) {
                    Ok(None)
                } else {
                    Err(InvariantViolation::TerminalDetailMismatch {
                        status: DeliveryStatus::Sent,
                    })
                }
            }
            DeliveryStatus::Failed => Err(InvariantViolation::AlreadyFailed),
            DeliveryStatus::Requested | DeliveryStatus::Validated | DeliveryStatus::Queued => {
                let event = DeliveryEvent::Sent(detail);
                self.apply(&event);
                Ok(Some(event))
            }
        }
    }

    pub fn mark_failed(
        &mut self,
        detail: FailureDetail,
    ) -> Result<Option<DeliveryEvent>, InvariantViolation> {
        match self.status {
            DeliveryStatus::Failed => {
                if self.failure.as_ref() == Some(&detail) {
                    Ok(None)
                } else {
                    Err(InvariantViolation::TerminalDetailMismatch {
                        status: DeliveryStatus::Failed,
                    })
                }
            }
            DeliveryStatus::Sent => Err(InvariantViolation::AlreadySent),
            DeliveryStatus::Requested | DeliveryStatus::Validated | DeliveryStatus::Queued => {
                let event = DeliveryEvent::Failed(detail);
                self.apply(&event);
                Ok(Some(event))
            }
        }
    }

    /// Fold one non-genesis event into state, advancing the version.
    fn apply(&mut self, event: &DeliveryEvent) {
        match event {
            DeliveryEvent::Requested { channel } => {
                self.channel = channel.clone();
                self.status = DeliveryStatus::Requested;
            }
            DeliveryEvent::Validated => self.status = DeliveryStatus::Validated,
            DeliveryEvent::Queued => self.status = DeliveryStatus::Queued,
            DeliveryEvent::Sent(detail) => {
                self.status = DeliveryStatus::Sent;
                self.sent = Some(detail.clone());
            }
            DeliveryEvent::Failed(detail) => {
                self.status = DeliveryStatus::Failed;
                self.failure = Some(detail.clone());
            }
        }
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn sent_detail() -> SentDetail {
        SentDetail {
            ts: "100.1".into(),
            channel: "#c".into(),
            attempts: 1,
        }
    }

    fn failure_detail() -> FailureDetail {
        FailureDetail {
            reason: "channel_not_found".into(),
            attempts: 2,
            retryable: false,
            last_error: Some("404".into()),
        }
    }

    #[test]
    fn request_starts_at_version_zero() {
        let (aggregate, event) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());

        assert_eq!(aggregate.version, 0);
        assert_eq!(aggregate.status, DeliveryStatus::Requested);
        assert_eq!(event, DeliveryEvent::Requested { channel: "#c".into() });
    }

    #[test]
    fn version_equals_event_count_minus_one_after_replay() {
        let id = DeliveryId::generate();
        let history = vec![
            DeliveryEvent::Requested { channel: "#c".into() },
            DeliveryEvent::Validated,
            DeliveryEvent::Queued,
            DeliveryEvent::Sent(sent_detail()),
        ];

        let aggregate = DeliveryRequest::reconstitute(id, tenant(), &history).unwrap();

        assert_eq!(aggregate.version, 3);
        assert_eq!(aggregate.status, DeliveryStatus::Sent);
        assert_eq!(aggregate.sent, Some(sent_detail()));
    }

    #[test]
    fn replay_is_deterministic() {
        let id = DeliveryId::generate();
        let history = vec![
            DeliveryEvent::Requested { channel: "#c".into() },
            DeliveryEvent::Sent(sent_detail()),
        ];

        let first = DeliveryRequest::reconstitute(id, tenant(), &history).unwrap();
        let second = DeliveryRequest::reconstitute(id, tenant(), &history).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn reconstitute_rejects_history_not_starting_with_requested() {
        let history = vec![DeliveryEvent::Validated];

        assert!(DeliveryRequest::reconstitute(DeliveryId::generate(), tenant(), &history).is_none());
        assert!(DeliveryRequest::reconstitute(DeliveryId::generate(), tenant(), &[]).is_none());
    }

    #[test]
    fn snapshot_plus_subsequent_events_matches_full_replay() {
        let id = DeliveryId::generate();
        let history = vec![
            DeliveryEvent::Requested { channel: "#c".into() },
            DeliveryEvent::Validated,
            DeliveryEvent::Queued,
            DeliveryEvent::Sent(sent_detail()),
        ];

        let full = DeliveryRequest::reconstitute(id, tenant(), &history).unwrap();

        let snapshot = DeliveryRequest::reconstitute(id, tenant(), &history[..2]).unwrap();
        let resumed = DeliveryRequest::from_snapshot(snapshot, &history[2..]);

        assert_eq!(resumed, full);
    }

    #[test]
    fn mark_sent_from_requested_jumps_forward() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());

        let event = aggregate.mark_sent(sent_detail()).unwrap();

        assert_eq!(event, Some(DeliveryEvent::Sent(sent_detail())));
        assert_eq!(aggregate.version, 1);
        assert_eq!(aggregate.status, DeliveryStatus::Sent);
    }

    #[test]
    fn repeated_mark_sent_with_matching_detail_is_a_noop() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());
        aggregate.mark_sent(sent_detail()).unwrap();

        let repeat = aggregate.mark_sent(sent_detail()).unwrap();

        assert_eq!(repeat, None);
        assert_eq!(aggregate.version, 1);
    }

    #[test]
    fn mark_sent_with_different_detail_after_sent_is_rejected() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());
        aggregate.mark_sent(sent_detail()).unwrap();

        let mut other = sent_detail();
        other.ts = "200.9".into();

        let err = aggregate.mark_sent(other).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::TerminalDetailMismatch {
                status: DeliveryStatus::Sent
            }
        );
        assert_eq!(aggregate.version, 1);
    }

    #[test]
    fn mark_failed_after_sent_is_rejected() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());
        aggregate.mark_sent(sent_detail()).unwrap();

        let err = aggregate.mark_failed(failure_detail()).unwrap_err();

        assert_eq!(err, InvariantViolation::AlreadySent);
        assert_eq!(aggregate.status, DeliveryStatus::Sent);
        assert_eq!(aggregate.version, 1);
    }

    #[test]
    fn mark_sent_after_failed_is_rejected() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());
        aggregate.mark_failed(failure_detail()).unwrap();

        let err = aggregate.mark_sent(sent_detail()).unwrap_err();

        assert_eq!(err, InvariantViolation::AlreadyFailed);
    }

    #[test]
    fn repeated_mark_failed_with_matching_detail_is_a_noop() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());
        aggregate.mark_failed(failure_detail()).unwrap();

        assert_eq!(aggregate.mark_failed(failure_detail()).unwrap(), None);
        assert_eq!(aggregate.version, 1);
    }

    #[test]
    fn mark_validated_after_queued_is_a_regression() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());
        aggregate.mark_queued().unwrap();

        let err = aggregate.mark_validated().unwrap_err();

        assert_eq!(
            err,
            InvariantViolation::StatusRegression {
                from: DeliveryStatus::Queued,
                to: DeliveryStatus::Validated,
            }
        );
    }

    #[test]
    fn forward_progression_emits_one_event_per_step() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());

        assert!(aggregate.mark_validated().unwrap().is_some());
        assert!(aggregate.mark_queued().unwrap().is_some());
        assert!(aggregate.mark_sent(sent_detail()).unwrap().is_some());
        assert_eq!(aggregate.version, 3);
    }

    #[test]
    fn repeated_non_terminal_marks_are_noops() {
        let (mut aggregate, _) =
            DeliveryRequest::request(DeliveryId::generate(), tenant(), "#c".into());

        aggregate.mark_validated().unwrap();
        assert_eq!(aggregate.mark_validated().unwrap(), None);

        aggregate.mark_queued().unwrap();
        assert_eq!(aggregate.mark_queued().unwrap(), None);
        assert_eq!(aggregate.version, 2);
    }
}
