use super::status::PaymentStatus;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub const MAX_MEMO_CHARS: usize = 200;

/// Locally generated primary key of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InternalId(Uuid);

impl InternalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for InternalId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for InternalId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier issued by the wallet gateway once it accepts a payment request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(PaymentError::Validation(
                "External id must not be empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A strictly positive fixed-point amount.
///
/// Wraps `rust_decimal::Decimal` so that the declared amount never passes through
/// floating point between the approval and completion handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::Validation(format!(
                "Amount must be positive, got {value}"
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Free-text memo shown by the wallet, bounded to [`MAX_MEMO_CHARS`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Memo(String);

impl Memo {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let chars = value.chars().count();
        if chars > MAX_MEMO_CHARS {
            return Err(PaymentError::Validation(format!(
                "Memo must be at most {MAX_MEMO_CHARS} characters, got {chars}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Memo {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Memo> for String {
    fn from(memo: Memo) -> Self {
        memo.0
    }
}

/// Scalar metadata value, passed through to the ledger untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(v) => v.fmt(f),
            MetadataValue::Integer(v) => v.fmt(f),
            MetadataValue::Float(v) => v.fmt(f),
            MetadataValue::Text(v) => f.write_str(v),
        }
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// Rejects metadata the ledger could not read back. JSON has no NaN or infinity.
pub fn validate_metadata(metadata: &Metadata) -> Result<()> {
    let non_finite = metadata
        .iter()
        .find(|(_, value)| matches!(value, MetadataValue::Float(f) if !f.is_finite()));
    match non_finite {
        Some((key, value)) => Err(PaymentError::Validation(format!(
            "Metadata '{key}' must be a finite number, got {value}"
        ))),
        None => Ok(()),
    }
}

/// A requested change of status, carrying whatever the target status needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Issue { external_id: ExternalId },
    BeginApproval,
    Approve,
    BeginCompletion,
    Submit,
    Complete { settlement_reference: String },
    Cancel { reason: String },
    Fail { reason: String },
    TimeOut,
}

impl Transition {
    pub fn target(&self) -> PaymentStatus {
        match self {
            Transition::Issue { .. } => PaymentStatus::PendingApproval,
            Transition::BeginApproval => PaymentStatus::Approving,
            Transition::Approve => PaymentStatus::Approved,
            Transition::BeginCompletion => PaymentStatus::PendingCompletion,
            Transition::Submit => PaymentStatus::Completing,
            Transition::Complete { .. } => PaymentStatus::Completed,
            Transition::Cancel { .. } => PaymentStatus::Cancelled,
            Transition::Fail { .. } => PaymentStatus::Failed,
            Transition::TimeOut => PaymentStatus::TimedOut,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub at: DateTime<Utc>,
}

/// Result of [`PaymentIntent::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The transition was accepted and the intent mutated.
    Applied,
    /// The same `(from, to)` pair was already applied; nothing changed.
    Duplicate,
    /// The intent moved on before this transition could be applied. The caller lost a race.
    Superseded(PaymentStatus),
}

/// One attempted payment, from request to terminal outcome.
///
/// This is also the projection written to the ledger: every field is serialized so the
/// stored record is the full current state, never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    internal_id: InternalId,
    external_id: Option<ExternalId>,
    amount: Amount,
    memo: Memo,
    metadata: Metadata,
    status: PaymentStatus,
    /// Retries consumed by the current approval or completion handshake.
    attempts: u32,
    settlement_reference: Option<String>,
    reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    timeout_deadline: DateTime<Utc>,
    /// Bumped on every mutation; the ledger never stores a lower version over a higher one.
    version: u64,
    history: Vec<TransitionRecord>,
}

impl PaymentIntent {
    pub fn new(
        amount: Amount,
        memo: Memo,
        metadata: Metadata,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let timeout_deadline = now.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            internal_id: InternalId::new(),
            external_id: None,
            amount,
            memo,
            metadata,
            status: PaymentStatus::Created,
            attempts: 0,
            settlement_reference: None,
            reason: None,
            created_at: now,
            updated_at: now,
            timeout_deadline,
            version: 1,
            history: Vec::new(),
        }
    }

    pub fn internal_id(&self) -> InternalId {
        self.internal_id
    }

    pub fn external_id(&self) -> Option<&ExternalId> {
        self.external_id.as_ref()
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn memo(&self) -> &Memo {
        &self.memo
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn settlement_reference(&self) -> Option<&str> {
        self.settlement_reference.as_deref()
    }

    /// Why the intent ended in `failed`, `cancelled` or `timed_out`.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn timeout_deadline(&self) -> DateTime<Utc> {
        self.timeout_deadline
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now >= self.timeout_deadline
    }

    /// Counts one retry of the handshake in progress.
    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.updated_at = now;
        self.version += 1;
    }

    /// Applies `transition` if the intent is still in `from`.
    ///
    /// Idempotent per `(internal_id, from, to)`: replaying an already applied pair is a
    /// no-op, and a transition whose `from` no longer matches is reported as superseded
    /// instead of failing, so racing cancellations, timeouts and service replies resolve
    /// to whichever was applied first.
    pub fn apply(
        &mut self,
        from: PaymentStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let to = transition.target();

        if self.history.iter().any(|r| r.from == from && r.to == to) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if self.status != from {
            return Ok(ApplyOutcome::Superseded(self.status));
        }
        if !from.can_transition_to(to) {
            return Err(PaymentError::IllegalTransition {
                internal_id: self.internal_id.to_string(),
                from,
                to,
            });
        }

        match transition {
            Transition::Issue { external_id } => match &self.external_id {
                Some(bound) if *bound != external_id => {
                    return Err(PaymentError::InvariantViolation(format!(
                        "payment {} is already bound to {bound}, refusing {external_id}",
                        self.internal_id
                    )));
                }
                _ => self.external_id = Some(external_id),
            },
            Transition::Submit => self.attempts = 0,
            Transition::Complete {
                settlement_reference,
            } => {
                if settlement_reference.trim().is_empty() {
                    return Err(PaymentError::InvariantViolation(format!(
                        "payment {} cannot complete without a settlement reference",
                        self.internal_id
                    )));
                }
                self.settlement_reference = Some(settlement_reference);
            }
            Transition::Cancel { reason } | Transition::Fail { reason } => {
                self.reason = Some(reason)
            }
            Transition::TimeOut => self.reason = Some("timeout".to_string()),
            Transition::BeginApproval | Transition::Approve | Transition::BeginCompletion => {}
        }

        self.history.push(TransitionRecord { from, to, at: now });
        self.status = to;
        self.updated_at = now;
        self.version += 1;
        Ok(ApplyOutcome::Applied)
    }
}
