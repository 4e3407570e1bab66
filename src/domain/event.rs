use super::intent::{ExternalId, InternalId};
use super::status::PaymentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound notification from the wallet gateway.
///
/// The gateway serializes events per external id; events for different payments may
/// interleave arbitrarily.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    ExternalIdIssued {
        internal_id: InternalId,
        external_id: ExternalId,
    },
    ReadyForApproval {
        external_id: ExternalId,
    },
    ReadyForCompletion {
        external_id: ExternalId,
        settlement_reference: String,
    },
    Cancelled {
        external_id: ExternalId,
    },
    Errored {
        external_id: ExternalId,
        error: String,
    },
}

impl GatewayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::ExternalIdIssued { .. } => "external_id_issued",
            GatewayEvent::ReadyForApproval { .. } => "ready_for_approval",
            GatewayEvent::ReadyForCompletion { .. } => "ready_for_completion",
            GatewayEvent::Cancelled { .. } => "cancelled",
            GatewayEvent::Errored { .. } => "errored",
        }
    }
}

/// In-band answer returned to the gateway for approval and completion requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayDecision {
    Approved,
    Completed,
    Rejected { reason: String },
}

impl GatewayDecision {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, GatewayDecision::Rejected { .. })
    }
}

/// Published once per accepted transition, after its ledger write was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentEvent {
    pub internal_id: InternalId,
    pub status: PaymentStatus,
    pub timestamp: DateTime<Utc>,
}
