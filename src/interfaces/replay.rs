use crate::application::engine::{EnginePorts, PaymentEngine};
use crate::application::inbox::GatewayInbox;
use crate::config::EngineConfig;
use crate::domain::event::{GatewayDecision, GatewayEvent};
use crate::domain::intent::{ExternalId, InternalId, Metadata};
use crate::domain::ledger::LedgerEntry;
use crate::domain::ports::LedgerStoreRef;
use crate::error::{PaymentError, Result};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::scripted::{
    ScriptedApprovalService, ScriptedCompletionService, ScriptedGateway, ScriptedOutcome,
};
use crate::interfaces::csv::ledger_writer::LABEL_KEY;
use crate::interfaces::csv::script_reader::{ScriptAction, ScriptRow};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Plays a CSV script against a `PaymentEngine` wired to scripted services.
///
/// Payments are named by the script's `payment` label. Gateway-side rows go through the
/// engine's inbox; caller-side rows (`start`, `abort`, `sweep`) call the engine directly.
pub struct Replay {
    engine: PaymentEngine,
    inbox: GatewayInbox,
    _listener: JoinHandle<()>,
    approvals: Arc<ScriptedApprovalService>,
    completions: Arc<ScriptedCompletionService>,
    labels: Vec<String>,
    internal_ids: HashMap<String, InternalId>,
    external_ids: HashMap<String, ExternalId>,
}

impl Replay {
    /// Must be called from within a tokio runtime.
    pub fn new(ledger: LedgerStoreRef, config: EngineConfig) -> Self {
        let approvals = Arc::new(ScriptedApprovalService::approving());
        let completions = Arc::new(ScriptedCompletionService::completing());
        let capacity = config.event_capacity;
        let engine = PaymentEngine::new(
            EnginePorts {
                gateway: Arc::new(ScriptedGateway::new()),
                approvals: approvals.clone(),
                completions: completions.clone(),
                ledger,
                clock: Arc::new(SystemClock),
            },
            config,
        );
        let (inbox, listener) = engine.spawn_inbox(capacity);
        Self {
            engine,
            inbox,
            _listener: listener,
            approvals,
            completions,
            labels: Vec::new(),
            internal_ids: HashMap::new(),
            external_ids: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &PaymentEngine {
        &self.engine
    }

    /// Applies one script row and returns the decision the gateway would receive.
    pub async fn apply(&mut self, row: ScriptRow) -> Result<Option<GatewayDecision>> {
        debug!(action = ?row.r#type, payment = %row.payment, "replaying row");
        match row.r#type {
            ScriptAction::Start => {
                if row.payment.is_empty() {
                    return Err(PaymentError::Validation(
                        "start requires a payment label".to_string(),
                    ));
                }
                if self.internal_ids.contains_key(&row.payment) {
                    return Err(PaymentError::Validation(format!(
                        "payment label '{}' already started",
                        row.payment
                    )));
                }
                let amount = row.amount.ok_or_else(|| {
                    PaymentError::Validation(format!("start for '{}' has no amount", row.payment))
                })?;
                let metadata = Metadata::from([(LABEL_KEY.to_string(), row.payment.clone().into())]);
                let internal_id = self
                    .engine
                    .start(amount, row.memo.unwrap_or_default(), metadata)
                    .await?;
                self.internal_ids.insert(row.payment.clone(), internal_id);
                self.labels.push(row.payment);
                Ok(None)
            }
            ScriptAction::Issue => {
                let internal_id = self.internal_id(&row.payment)?;
                let external_id = ExternalId::new(row.reference.unwrap_or_default())?;
                self.inbox
                    .deliver(GatewayEvent::ExternalIdIssued {
                        internal_id,
                        external_id: external_id.clone(),
                    })
                    .await?;
                self.external_ids.insert(row.payment, external_id);
                Ok(None)
            }
            ScriptAction::Approve => {
                let external_id = self.external_id(&row.payment)?;
                if let Some(internal_id) = self.internal_ids.get(&row.payment) {
                    for outcome in parse_outcomes(row.outcome.as_deref())? {
                        self.approvals.push(*internal_id, outcome);
                    }
                }
                self.inbox
                    .deliver(GatewayEvent::ReadyForApproval { external_id })
                    .await
            }
            ScriptAction::Complete => {
                let external_id = self.external_id(&row.payment)?;
                if let Some(internal_id) = self.internal_ids.get(&row.payment) {
                    for outcome in parse_outcomes(row.outcome.as_deref())? {
                        self.completions.push(*internal_id, outcome);
                    }
                }
                self.inbox
                    .deliver(GatewayEvent::ReadyForCompletion {
                        external_id,
                        settlement_reference: row.reference.unwrap_or_default(),
                    })
                    .await
            }
            ScriptAction::Cancel => {
                let external_id = self.external_id(&row.payment)?;
                self.inbox
                    .deliver(GatewayEvent::Cancelled { external_id })
                    .await
            }
            ScriptAction::Error => {
                let external_id = self.external_id(&row.payment)?;
                self.inbox
                    .deliver(GatewayEvent::Errored {
                        external_id,
                        error: row.reference.unwrap_or_else(|| "unknown".to_string()),
                    })
                    .await
            }
            ScriptAction::Abort => {
                let internal_id = self.internal_id(&row.payment)?;
                self.engine.cancel(internal_id).await.map(|_| None)
            }
            ScriptAction::Sweep => {
                self.engine.sweep_timeouts().await;
                Ok(None)
            }
        }
    }

    /// Ledger entries of every started payment, in the order they were started.
    pub async fn report(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            if let Some(internal_id) = self.internal_ids.get(label)
                && let Some(entry) = self.engine.ledger().get(*internal_id).await?
            {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn internal_id(&self, label: &str) -> Result<InternalId> {
        self.internal_ids
            .get(label)
            .copied()
            .ok_or_else(|| PaymentError::UnknownPayment(label.to_string()))
    }

    /// The id issued for `label`, or the label itself for payments the script never issued.
    fn external_id(&self, label: &str) -> Result<ExternalId> {
        match self.external_ids.get(label) {
            Some(external_id) => Ok(external_id.clone()),
            None => ExternalId::new(label),
        }
    }
}

fn parse_outcomes(outcome: Option<&str>) -> Result<Vec<ScriptedOutcome>> {
    outcome
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}
