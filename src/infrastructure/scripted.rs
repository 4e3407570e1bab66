//! Deterministic stand-ins for the wallet gateway and the approval/completion services.
//!
//! The replay binary and the test suites use these to drive the engine without a real
//! wallet network or backend.

use crate::domain::intent::{ExternalId, InternalId};
use crate::domain::ports::{
    ApprovalResponse, ApprovalService, CompletionResponse, CompletionService, PaymentRequest,
    WalletGateway,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Mutex;

/// What a scripted service answers on its next call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Accept,
    Deny(String),
    Transient(String),
}

impl FromStr for ScriptedOutcome {
    type Err = PaymentError;

    /// Parses `accept`, `approve`, `complete`, `deny[:reason]` or `transient[:reason]`.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, detail) = match s.split_once(':') {
            Some((kind, detail)) => (kind.trim(), Some(detail.trim().to_string())),
            None => (s.trim(), None),
        };
        match kind.to_ascii_lowercase().as_str() {
            "" | "accept" | "approve" | "complete" => Ok(ScriptedOutcome::Accept),
            "deny" => Ok(ScriptedOutcome::Deny(
                detail.unwrap_or_else(|| "denied".to_string()),
            )),
            "transient" => Ok(ScriptedOutcome::Transient(
                detail.unwrap_or_else(|| "service unavailable".to_string()),
            )),
            other => Err(PaymentError::Validation(format!(
                "Unknown scripted outcome '{other}'"
            ))),
        }
    }
}

#[derive(Debug)]
struct Script {
    fallback: ScriptedOutcome,
    queued: Mutex<HashMap<InternalId, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<HashMap<InternalId, usize>>,
}

impl Script {
    fn new(fallback: ScriptedOutcome) -> Self {
        Self {
            fallback,
            queued: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    fn push(&self, internal_id: InternalId, outcome: ScriptedOutcome) {
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        queued.entry(internal_id).or_default().push_back(outcome);
    }

    fn next(&self, internal_id: InternalId) -> ScriptedOutcome {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(internal_id)
            .or_default() += 1;
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&internal_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn calls(&self, internal_id: InternalId) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&internal_id)
            .copied()
            .unwrap_or_default()
    }
}

/// Approval service answering from a per-payment queue, then from its fallback.
#[derive(Debug)]
pub struct ScriptedApprovalService {
    script: Script,
}

impl ScriptedApprovalService {
    pub fn new(fallback: ScriptedOutcome) -> Self {
        Self {
            script: Script::new(fallback),
        }
    }

    /// Approves everything that has nothing queued.
    pub fn approving() -> Self {
        Self::new(ScriptedOutcome::Accept)
    }

    pub fn push(&self, internal_id: InternalId, outcome: ScriptedOutcome) {
        self.script.push(internal_id, outcome);
    }

    pub fn calls(&self, internal_id: InternalId) -> usize {
        self.script.calls(internal_id)
    }
}

#[async_trait]
impl ApprovalService for ScriptedApprovalService {
    async fn approve(&self, request: &PaymentRequest) -> Result<ApprovalResponse> {
        match self.script.next(request.internal_id) {
            ScriptedOutcome::Accept => Ok(ApprovalResponse {
                approved: true,
                reason: None,
            }),
            ScriptedOutcome::Deny(reason) => Ok(ApprovalResponse {
                approved: false,
                reason: Some(reason),
            }),
            ScriptedOutcome::Transient(reason) => Err(PaymentError::TransientService(reason)),
        }
    }
}

/// Completion service answering from a per-payment queue, then from its fallback.
#[derive(Debug)]
pub struct ScriptedCompletionService {
    script: Script,
}

impl ScriptedCompletionService {
    pub fn new(fallback: ScriptedOutcome) -> Self {
        Self {
            script: Script::new(fallback),
        }
    }

    pub fn completing() -> Self {
        Self::new(ScriptedOutcome::Accept)
    }

    pub fn push(&self, internal_id: InternalId, outcome: ScriptedOutcome) {
        self.script.push(internal_id, outcome);
    }

    pub fn calls(&self, internal_id: InternalId) -> usize {
        self.script.calls(internal_id)
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletionService {
    async fn complete(
        &self,
        internal_id: InternalId,
        _settlement_reference: &str,
    ) -> Result<CompletionResponse> {
        match self.script.next(internal_id) {
            ScriptedOutcome::Accept => Ok(CompletionResponse {
                completed: true,
                reason: None,
            }),
            ScriptedOutcome::Deny(reason) => Ok(CompletionResponse {
                completed: false,
                reason: Some(reason),
            }),
            ScriptedOutcome::Transient(reason) => Err(PaymentError::TransientService(reason)),
        }
    }
}

/// Gateway that records what it was asked to do. External ids are delivered separately
/// as `GatewayEvent::ExternalIdIssued`.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    requests: Mutex<Vec<PaymentRequest>>,
    cancellations: Mutex<Vec<ExternalId>>,
    failure: Option<String>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway that refuses every payment request.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<PaymentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cancellations(&self) -> Vec<ExternalId> {
        self.cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl WalletGateway for ScriptedGateway {
    async fn request_payment(&self, request: PaymentRequest) -> Result<()> {
        if let Some(reason) = &self.failure {
            return Err(PaymentError::TransientService(reason.clone()));
        }
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        Ok(())
    }

    async fn cancel_payment(&self, external_id: &ExternalId) -> Result<()> {
        self.cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(external_id.clone());
        Ok(())
    }
}
