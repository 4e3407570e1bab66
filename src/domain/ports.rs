use super::intent::{Amount, ExternalId, InternalId, Memo, Metadata, PaymentIntent};
use super::ledger::LedgerEntry;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// What the gateway and the approval service get to see of an intent.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub internal_id: InternalId,
    pub amount: Amount,
    pub memo: Memo,
    pub metadata: Metadata,
}

impl From<&PaymentIntent> for PaymentRequest {
    fn from(intent: &PaymentIntent) -> Self {
        Self {
            internal_id: intent.internal_id(),
            amount: intent.amount(),
            memo: intent.memo().clone(),
            metadata: intent.metadata().clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    pub completed: bool,
    pub reason: Option<String>,
}

/// The external wallet. Its callbacks come back as [`GatewayEvent`]s.
///
/// [`GatewayEvent`]: super::event::GatewayEvent
#[async_trait]
pub trait WalletGateway: Send + Sync {
    /// Asks the wallet to create a payment. The external id arrives later as
    /// `GatewayEvent::ExternalIdIssued`.
    async fn request_payment(&self, request: PaymentRequest) -> Result<()>;
    async fn cancel_payment(&self, external_id: &ExternalId) -> Result<()>;
}

/// Server-side approval handshake. Transient failures must be reported as
/// `PaymentError::TransientService`; anything else is terminal.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn approve(&self, request: &PaymentRequest) -> Result<ApprovalResponse>;
}

/// Server-side completion handshake, same error contract as [`ApprovalService`].
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        internal_id: InternalId,
        settlement_reference: &str,
    ) -> Result<CompletionResponse>;
}

/// Durable audit record of every intent, keyed by internal id.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Stores the full projection and returns the entry with ledger-assigned timestamps.
    async fn upsert(&self, projection: PaymentIntent) -> Result<LedgerEntry>;
    async fn get(&self, internal_id: InternalId) -> Result<Option<LedgerEntry>>;
    /// Entries in a non-terminal status first recorded before `older_than`.
    async fn scan_non_terminal_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type WalletGatewayRef = Arc<dyn WalletGateway>;
pub type ApprovalServiceRef = Arc<dyn ApprovalService>;
pub type CompletionServiceRef = Arc<dyn CompletionService>;
pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type ClockRef = Arc<dyn Clock>;
