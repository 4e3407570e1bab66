use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a payment intent.
///
/// The happy path is strictly linear:
///
/// ```text
/// created -> pending_approval -> approving -> approved
///         -> pending_completion -> completing -> completed
/// ```
///
/// `cancelled`, `failed` and `timed_out` are reachable from every non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    PendingApproval,
    Approving,
    Approved,
    PendingCompletion,
    Completing,
    Completed,
    Cancelled,
    Failed,
    TimedOut,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 10] = [
        PaymentStatus::Created,
        PaymentStatus::PendingApproval,
        PaymentStatus::Approving,
        PaymentStatus::Approved,
        PaymentStatus::PendingCompletion,
        PaymentStatus::Completing,
        PaymentStatus::Completed,
        PaymentStatus::Cancelled,
        PaymentStatus::Failed,
        PaymentStatus::TimedOut,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Cancelled
                | PaymentStatus::Failed
                | PaymentStatus::TimedOut
        )
    }

    /// Whether `self -> to` is an edge of the transition graph.
    pub fn can_transition_to(self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;

        if self.is_terminal() {
            return false;
        }
        match to {
            Cancelled | Failed | TimedOut => true,
            PendingApproval => self == Created,
            Approving => self == PendingApproval,
            Approved => self == Approving,
            PendingCompletion => self == Approved,
            Completing => self == PendingCompletion,
            Completed => self == Completing,
            Created => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::PendingApproval => "pending_approval",
            PaymentStatus::Approving => "approving",
            PaymentStatus::Approved => "approved",
            PaymentStatus::PendingCompletion => "pending_completion",
            PaymentStatus::Completing => "completing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Failed => "failed",
            PaymentStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
