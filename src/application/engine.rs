use crate::application::events::{EventBus, IntentSubscription};
use crate::application::registry::{IntentHandle, PaymentRegistry};
use crate::config::EngineConfig;
use crate::domain::event::{GatewayDecision, GatewayEvent, IntentEvent};
use crate::domain::intent::{
    Amount, ApplyOutcome, ExternalId, InternalId, Memo, Metadata, PaymentIntent, Transition,
    validate_metadata,
};
use crate::domain::ledger::LedgerEntry;
use crate::domain::ports::{
    ApprovalResponse, ApprovalServiceRef, ClockRef, CompletionResponse, CompletionServiceRef,
    LedgerStoreRef, PaymentRequest, WalletGatewayRef,
};
use crate::domain::status::PaymentStatus;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The external collaborators the engine is wired to.
#[derive(Clone)]
pub struct EnginePorts {
    pub gateway: WalletGatewayRef,
    pub approvals: ApprovalServiceRef,
    pub completions: CompletionServiceRef,
    pub ledger: LedgerStoreRef,
    pub clock: ClockRef,
}

struct Inner {
    registry: PaymentRegistry,
    ports: EnginePorts,
    events: EventBus,
    config: EngineConfig,
}

/// Drives payment intents from creation to a terminal status.
///
/// `PaymentEngine` owns the registry of active intents and routes wallet gateway events to
/// them. Each intent is guarded by its own lock; remote calls and ledger writes happen with
/// that lock released and their outcome is applied afterwards, so a cancellation or a timeout
/// that lands first simply wins. Every accepted transition is written to the ledger before
/// it is published as an [`IntentEvent`].
///
/// Cloning is cheap and shares the same engine.
#[derive(Clone)]
pub struct PaymentEngine {
    inner: Arc<Inner>,
}

impl PaymentEngine {
    /// Creates a new `PaymentEngine` instance.
    ///
    /// # Arguments
    ///
    /// * `ports` - The wallet gateway, remote services, ledger and clock.
    /// * `config` - Timeouts, sweep period and retry policy.
    pub fn new(ports: EnginePorts, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: PaymentRegistry::new(),
                events: EventBus::new(config.event_capacity),
                ports,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PaymentRegistry {
        &self.inner.registry
    }

    pub fn ledger(&self) -> &LedgerStoreRef {
        &self.inner.ports.ledger
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.ports.clock.now()
    }

    /// Every intent event, across all payments.
    pub fn subscribe(&self) -> broadcast::Receiver<IntentEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_to(&self, internal_id: InternalId) -> IntentSubscription {
        self.inner.events.subscribe_to(internal_id)
    }

    /// Snapshot of an intent the engine still holds. Ended intents are read from the ledger,
    /// except those whose terminal write is still pending.
    pub async fn intent(&self, internal_id: InternalId) -> Option<PaymentIntent> {
        match self.inner.registry.lookup_by_internal(internal_id).await {
            Some(handle) => Some(handle.snapshot().await),
            None => None,
        }
    }

    /// Creates a payment intent and asks the wallet gateway for a payment.
    ///
    /// Returns as soon as the intent is registered and its first ledger record is written;
    /// the gateway request runs in the background and its external id arrives later through
    /// [`on_external_id_issued`](Self::on_external_id_issued).
    pub async fn start(
        &self,
        amount: Decimal,
        memo: impl Into<String>,
        metadata: Metadata,
    ) -> Result<InternalId> {
        let amount = Amount::new(amount)?;
        let memo = Memo::new(memo)?;
        validate_metadata(&metadata)?;
        let now = self.now();

        let intent = PaymentIntent::new(amount, memo, metadata, now, self.inner.config.payment_timeout);
        let request = PaymentRequest::from(&intent);
        let internal_id = intent.internal_id();
        let handle = self.inner.registry.register(intent).await?;

        if let Err(e) = self.record(&handle, PaymentStatus::Created).await {
            self.inner.registry.unregister(internal_id).await;
            return Err(e);
        }
        self.publish(&handle, PaymentStatus::Created, now);
        info!(internal_id = %internal_id, amount = %amount, "payment intent created");

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.inner.ports.gateway.request_payment(request).await {
                warn!(internal_id = %internal_id, error = %e, "wallet payment request failed");
                let transition = Transition::Fail {
                    reason: format!("wallet_request_failed: {e}"),
                };
                if let Some(handle) = engine.inner.registry.lookup_by_internal(internal_id).await
                    && let Err(e) = engine
                        .transition(&handle, Some(PaymentStatus::Created), transition)
                        .await
                {
                    error!(internal_id = %internal_id, error = %e, "could not record wallet request failure");
                }
            }
        });

        Ok(internal_id)
    }

    /// Binds the gateway's external id and moves the intent to `pending_approval`.
    pub async fn on_external_id_issued(
        &self,
        internal_id: InternalId,
        external_id: ExternalId,
    ) -> Result<()> {
        let handle = match self
            .inner
            .registry
            .bind_external_id(internal_id, external_id.clone())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(internal_id = %internal_id, external_id = %external_id, error = %e, "external id rejected");
                return Err(e);
            }
        };

        let outcome = self
            .transition(
                &handle,
                Some(PaymentStatus::Created),
                Transition::Issue { external_id },
            )
            .await?;
        if let ApplyOutcome::Superseded(status) = outcome {
            debug!(internal_id = %internal_id, status = %status, "external id issued for an intent that moved on");
        }
        Ok(())
    }

    /// Runs the approval handshake and returns the decision the gateway waits for.
    ///
    /// Fails with `UnknownPayment` when no active intent holds `external_id`; the caller must
    /// not retry that.
    pub async fn on_ready_for_approval(&self, external_id: &ExternalId) -> Result<GatewayDecision> {
        let handle = self.active_by_external(external_id).await?;
        let (request, status) = {
            let intent = handle.lock().await;
            (PaymentRequest::from(&*intent), intent.status())
        };

        match status {
            PaymentStatus::PendingApproval => {}
            PaymentStatus::Approved | PaymentStatus::PendingCompletion | PaymentStatus::Completing => {
                return Ok(GatewayDecision::Approved);
            }
            s if s.is_terminal() => return Ok(rejected_because(s)),
            s => return Err(invalid_state(&handle, s, "approved")),
        }

        // Only the caller that moved the intent into `approving` runs the handshake.
        match self
            .transition(&handle, Some(PaymentStatus::PendingApproval), Transition::BeginApproval)
            .await?
        {
            ApplyOutcome::Applied => {}
            ApplyOutcome::Duplicate => {
                return Err(invalid_state(&handle, PaymentStatus::Approving, "approved"));
            }
            ApplyOutcome::Superseded(s) => return Ok(rejected_because(s)),
        }

        let approvals = &self.inner.ports.approvals;
        let result = self
            .call_with_retry(&handle, PaymentStatus::Approving, "approval", || {
                approvals.approve(&request)
            })
            .await;

        let transition = match result {
            Ok(ApprovalResponse { approved: true, .. }) => Transition::Approve,
            Ok(ApprovalResponse { reason, .. }) => Transition::Fail {
                reason: PaymentError::TerminalDenial(
                    reason.unwrap_or_else(|| "approval denied".to_string()),
                )
                .to_string(),
            },
            Err(e) => Transition::Fail {
                reason: format!("approval failed: {e}"),
            },
        };
        self.settle(&handle, PaymentStatus::Approving, transition, GatewayDecision::Approved)
            .await
    }

    /// Runs the completion handshake with the settlement reference supplied by the gateway.
    pub async fn on_ready_for_completion(
        &self,
        external_id: &ExternalId,
        settlement_reference: &str,
    ) -> Result<GatewayDecision> {
        let handle = self.active_by_external(external_id).await?;
        if settlement_reference.trim().is_empty() {
            return Err(PaymentError::Validation(format!(
                "Settlement reference for {external_id} must not be empty"
            )));
        }
        let status = handle.lock().await.status();

        match status {
            PaymentStatus::Approved => {}
            s if s.is_terminal() => return Ok(rejected_because(s)),
            s => return Err(invalid_state(&handle, s, "completed")),
        }

        for (from, transition) in [
            (PaymentStatus::Approved, Transition::BeginCompletion),
            (PaymentStatus::PendingCompletion, Transition::Submit),
        ] {
            match self.transition(&handle, Some(from), transition).await? {
                ApplyOutcome::Applied => {}
                ApplyOutcome::Duplicate => {
                    return Err(invalid_state(&handle, PaymentStatus::Completing, "completed"));
                }
                ApplyOutcome::Superseded(s) => return Ok(rejected_because(s)),
            }
        }

        let internal_id = handle.internal_id();
        let completions = &self.inner.ports.completions;
        let result = self
            .call_with_retry(&handle, PaymentStatus::Completing, "completion", || {
                completions.complete(internal_id, settlement_reference)
            })
            .await;

        let transition = match result {
            Ok(CompletionResponse { completed: true, .. }) => Transition::Complete {
                settlement_reference: settlement_reference.to_string(),
            },
            Ok(CompletionResponse { reason, .. }) => Transition::Fail {
                reason: PaymentError::TerminalDenial(
                    reason.unwrap_or_else(|| "completion denied".to_string()),
                )
                .to_string(),
            },
            Err(e) => Transition::Fail {
                reason: format!("completion failed: {e}"),
            },
        };
        self.settle(&handle, PaymentStatus::Completing, transition, GatewayDecision::Completed)
            .await
    }

    /// Wallet-side cancellation. A no-op for intents that already ended.
    pub async fn on_cancel(&self, external_id: &ExternalId) -> Result<()> {
        self.end_from_gateway(
            external_id,
            Transition::Cancel {
                reason: "cancelled_by_wallet".to_string(),
            },
        )
        .await
    }

    /// Wallet-side error. A no-op for intents that already ended.
    pub async fn on_error(&self, external_id: &ExternalId, error: &str) -> Result<()> {
        self.end_from_gateway(
            external_id,
            Transition::Fail {
                reason: format!("wallet_error: {error}"),
            },
        )
        .await
    }

    /// Caller-initiated cancellation; only legal while the intent is non-terminal.
    pub async fn cancel(&self, internal_id: InternalId) -> Result<()> {
        let Some(handle) = self.inner.registry.lookup_by_internal(internal_id).await else {
            return match self.inner.ports.ledger.get(internal_id).await? {
                Some(entry) => Err(PaymentError::InvalidState {
                    internal_id: internal_id.to_string(),
                    status: entry.projection.status(),
                    action: "cancelled",
                }),
                None => Err(PaymentError::UnknownPayment(internal_id.to_string())),
            };
        };

        let transition = Transition::Cancel {
            reason: "cancelled_by_caller".to_string(),
        };
        if let ApplyOutcome::Superseded(status) = self.transition(&handle, None, transition).await? {
            return Err(invalid_state(&handle, status, "cancelled"));
        }

        let external_id = handle.lock().await.external_id().cloned();
        if let Some(external_id) = external_id
            && let Err(e) = self.inner.ports.gateway.cancel_payment(&external_id).await
        {
            warn!(internal_id = %internal_id, external_id = %external_id, error = %e, "wallet cancel failed");
        }
        Ok(())
    }

    /// Routes one gateway event to its handler.
    pub async fn dispatch(&self, event: GatewayEvent) -> Result<Option<GatewayDecision>> {
        match event {
            GatewayEvent::ExternalIdIssued {
                internal_id,
                external_id,
            } => self
                .on_external_id_issued(internal_id, external_id)
                .await
                .map(|_| None),
            GatewayEvent::ReadyForApproval { external_id } => {
                self.on_ready_for_approval(&external_id).await.map(Some)
            }
            GatewayEvent::ReadyForCompletion {
                external_id,
                settlement_reference,
            } => self
                .on_ready_for_completion(&external_id, &settlement_reference)
                .await
                .map(Some),
            GatewayEvent::Cancelled { external_id } => {
                self.on_cancel(&external_id).await.map(|_| None)
            }
            GatewayEvent::Errored { external_id, error } => {
                self.on_error(&external_id, &error).await.map(|_| None)
            }
        }
    }

    /// Times out every active intent whose deadline has passed and returns their ids.
    ///
    /// Intents that reach a terminal status between selection and transition are skipped.
    /// The same pass retries terminal ledger writes that failed earlier and resolves ledger
    /// records of other processes that outlived the payment timeout, see
    /// [`recover_orphans`](Self::recover_orphans).
    pub async fn sweep_timeouts(&self) -> Vec<InternalId> {
        let now = self.now();
        let pruned = self.inner.registry.prune_retired(now).await;
        if pruned > 0 {
            debug!(pruned, "retired external ids forgotten");
        }
        self.retry_terminal_writes(now).await;

        let mut timed_out = Vec::new();
        for handle in self.inner.registry.expired(now).await {
            match self.transition(&handle, None, Transition::TimeOut).await {
                Ok(ApplyOutcome::Applied) => timed_out.push(handle.internal_id()),
                Ok(_) => {}
                Err(e) => {
                    error!(internal_id = %handle.internal_id(), error = %e, "timeout transition failed");
                }
            }
        }
        if !timed_out.is_empty() {
            info!(count = timed_out.len(), "payment intents timed out");
        }

        match self.recover_orphans().await {
            Ok(resolved) if !resolved.is_empty() => {
                info!(count = resolved.len(), "orphaned payments resolved by sweep");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "orphan scan failed"),
        }
        timed_out
    }

    /// Writes ended intents whose terminal ledger write failed, retiring each one that
    /// goes through.
    async fn retry_terminal_writes(&self, now: DateTime<Utc>) {
        for handle in self.inner.registry.unrecorded().await {
            let status = handle.lock().await.status();
            if self.record(&handle, status).await.is_ok() {
                info!(internal_id = %handle.internal_id(), status = %status, "delayed ledger write recorded");
                self.retire(&handle, status, now).await;
                self.publish(&handle, status, now);
            }
        }
    }

    /// Runs [`sweep_timeouts`](Self::sweep_timeouts) every `sweep_interval` until `shutdown`
    /// flips to `true`.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let period = engine.inner.config.sweep_interval;
            info!(sweep_interval_ms = period.as_millis() as u64, "timeout sweeper started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        engine.sweep_timeouts().await;
                    }
                }
            }
            info!("timeout sweeper stopped");
        })
    }

    async fn active_by_external(&self, external_id: &ExternalId) -> Result<Arc<IntentHandle>> {
        match self.inner.registry.lookup_by_external(external_id).await {
            Some(handle) => Ok(handle),
            None => {
                warn!(external_id = %external_id, "event for unknown payment");
                Err(PaymentError::UnknownPayment(external_id.to_string()))
            }
        }
    }

    async fn end_from_gateway(&self, external_id: &ExternalId, transition: Transition) -> Result<()> {
        let Some(handle) = self.inner.registry.lookup_by_external(external_id).await else {
            if let Some(retired) = self.inner.registry.retired(external_id).await {
                debug!(
                    external_id = %external_id,
                    internal_id = %retired.internal_id,
                    status = %retired.status,
                    "ignoring gateway event for ended payment"
                );
                return Ok(());
            }
            warn!(external_id = %external_id, "event for unknown payment");
            return Err(PaymentError::UnknownPayment(external_id.to_string()));
        };
        self.transition(&handle, None, transition).await?;
        Ok(())
    }

    /// Applies the outcome of a remote handshake and maps it to the gateway's answer.
    async fn settle(
        &self,
        handle: &Arc<IntentHandle>,
        from: PaymentStatus,
        transition: Transition,
        accepted: GatewayDecision,
    ) -> Result<GatewayDecision> {
        let target = transition.target();
        match self.transition(handle, Some(from), transition).await? {
            ApplyOutcome::Superseded(s) => Ok(rejected_because(s)),
            _ if target == PaymentStatus::Failed => {
                let reason = handle
                    .lock()
                    .await
                    .reason()
                    .unwrap_or("failed")
                    .to_string();
                Ok(GatewayDecision::Rejected { reason })
            }
            _ => Ok(accepted),
        }
    }

    /// Calls a remote service, retrying transient failures with backoff.
    ///
    /// Each retry is counted on the intent. Retrying stops early once the intent left
    /// `phase`, e.g. because it was cancelled or timed out meanwhile.
    async fn call_with_retry<T, F, Fut>(
        &self,
        handle: &IntentHandle,
        phase: PaymentStatus,
        operation: &'static str,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.inner.config.retry;
        loop {
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            let retries = {
                let mut intent = handle.lock().await;
                if intent.status() != phase || !policy.should_retry(intent.attempts()) {
                    return Err(error);
                }
                intent.record_attempt(self.now());
                intent.attempts()
            };

            let delay = policy.delay_for(retries - 1);
            warn!(
                internal_id = %handle.internal_id(),
                operation,
                attempt = retries,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient service failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Applies `transition` under the intent lock, then records and publishes it.
    ///
    /// `from = None` means "whatever the intent is in now" and is used for the transitions
    /// reachable from any non-terminal status. An intent that already ended reports
    /// `Superseded` instead.
    ///
    /// A failed ledger write does not undo or block the transition, and nothing is
    /// published for it. The next write of the intent carries the full projection; a
    /// terminal intent stays registered until the sweep manages to record it.
    pub(crate) async fn transition(
        &self,
        handle: &Arc<IntentHandle>,
        from: Option<PaymentStatus>,
        transition: Transition,
    ) -> Result<ApplyOutcome> {
        let internal_id = handle.internal_id();
        let now = self.now();
        let (outcome, from, to) = {
            let mut intent = handle.lock().await;
            let current = intent.status();
            let from = from.unwrap_or(current);
            let to = transition.target();
            if from == current && current.is_terminal() {
                (ApplyOutcome::Superseded(current), from, to)
            } else {
                (intent.apply(from, transition, now)?, from, to)
            }
        };

        match outcome {
            ApplyOutcome::Applied => {
                info!(internal_id = %internal_id, from = %from, to = %to, "payment transition applied");
                match self.record(handle, to).await {
                    Ok(_) => {
                        if to.is_terminal() {
                            self.retire(handle, to, now).await;
                        }
                        self.publish(handle, to, now);
                    }
                    Err(_) if to.is_terminal() => {
                        self.inner.registry.hold_unrecorded(internal_id).await;
                    }
                    Err(_) => {}
                }
            }
            ApplyOutcome::Duplicate => {
                debug!(internal_id = %internal_id, from = %from, to = %to, "duplicate transition dropped");
            }
            ApplyOutcome::Superseded(current) => {
                debug!(internal_id = %internal_id, from = %from, to = %to, current = %current, "stale transition discarded");
            }
        }
        Ok(outcome)
    }

    /// Writes the intent's current projection to the ledger.
    ///
    /// Writes of one intent are ordered by its persist lock and always carry the latest
    /// snapshot, so the ledger never goes backwards.
    async fn record(&self, handle: &IntentHandle, status: PaymentStatus) -> Result<LedgerEntry> {
        let _order = handle.lock_persist().await;
        let projection = handle.snapshot().await;
        match self.inner.ports.ledger.upsert(projection).await {
            Ok(entry) => Ok(entry),
            Err(e) => {
                error!(internal_id = %handle.internal_id(), status = %status, error = %e, "ledger write failed");
                Err(e)
            }
        }
    }

    fn publish(&self, handle: &IntentHandle, status: PaymentStatus, at: DateTime<Utc>) {
        self.inner.events.publish(IntentEvent {
            internal_id: handle.internal_id(),
            status,
            timestamp: at,
        });
    }

    async fn retire(&self, handle: &IntentHandle, status: PaymentStatus, now: DateTime<Utc>) {
        let until = retention_deadline(now, self.inner.config.retired_retention);
        self.inner
            .registry
            .retire(handle.internal_id(), status, now, until)
            .await;
    }
}

fn rejected_because(status: PaymentStatus) -> GatewayDecision {
    GatewayDecision::Rejected {
        reason: format!("payment is {status}"),
    }
}

fn invalid_state(handle: &IntentHandle, status: PaymentStatus, action: &'static str) -> PaymentError {
    PaymentError::InvalidState {
        internal_id: handle.internal_id().to_string(),
        status,
        action,
    }
}

fn retention_deadline(now: DateTime<Utc>, retention: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| now.checked_add_signed(r))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::retry::RetryPolicy;
    use crate::domain::intent::MetadataValue;
    use crate::domain::ports::LedgerStore;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use crate::infrastructure::scripted::{
        ScriptedApprovalService, ScriptedCompletionService, ScriptedGateway, ScriptedOutcome,
    };
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory ledger that fails the next `failures` upserts.
    struct FlakyLedger {
        inner: InMemoryLedgerStore,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LedgerStore for FlakyLedger {
        async fn upsert(&self, projection: PaymentIntent) -> Result<LedgerEntry> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(PaymentError::Storage("disk full".to_string()));
            }
            self.inner.upsert(projection).await
        }

        async fn get(&self, internal_id: InternalId) -> Result<Option<LedgerEntry>> {
            self.inner.get(internal_id).await
        }

        async fn scan_non_terminal_older_than(
            &self,
            older_than: DateTime<Utc>,
        ) -> Result<Vec<LedgerEntry>> {
            self.inner.scan_non_terminal_older_than(older_than).await
        }
    }

    struct Harness {
        engine: PaymentEngine,
        gateway: Arc<ScriptedGateway>,
        approvals: Arc<ScriptedApprovalService>,
        completions: Arc<ScriptedCompletionService>,
        ledger: InMemoryLedgerStore,
        ledger_failures: Arc<AtomicUsize>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let gateway = Arc::new(ScriptedGateway::new());
        let approvals = Arc::new(ScriptedApprovalService::approving());
        let completions = Arc::new(ScriptedCompletionService::completing());
        let ledger = InMemoryLedgerStore::with_clock(clock.clone());
        let ledger_failures = Arc::new(AtomicUsize::new(0));
        let ports = EnginePorts {
            gateway: gateway.clone(),
            approvals: approvals.clone(),
            completions: completions.clone(),
            ledger: Arc::new(FlakyLedger {
                inner: ledger.clone(),
                failures: ledger_failures.clone(),
            }),
            clock: clock.clone(),
        };
        let config = EngineConfig::default().with_retry(RetryPolicy::immediate(3));
        Harness {
            engine: PaymentEngine::new(ports, config),
            gateway,
            approvals,
            completions,
            ledger,
            ledger_failures,
            clock,
        }
    }

    fn ext(id: &str) -> ExternalId {
        ExternalId::new(id).unwrap()
    }

    async fn issued(h: &Harness, external: &str) -> InternalId {
        let id = h.engine.start(dec!(1.0), "entry", Metadata::new()).await.unwrap();
        h.engine.on_external_id_issued(id, ext(external)).await.unwrap();
        id
    }

    async fn ledger_status(h: &Harness, id: InternalId) -> PaymentStatus {
        h.ledger.get(id).await.unwrap().unwrap().projection.status()
    }

    #[tokio::test]
    async fn test_start_validates_input() {
        let h = harness();
        assert!(matches!(
            h.engine.start(dec!(0), "entry", Metadata::new()).await,
            Err(PaymentError::Validation(_))
        ));
        assert!(matches!(
            h.engine.start(dec!(1), "x".repeat(201), Metadata::new()).await,
            Err(PaymentError::Validation(_))
        ));
        assert!(h.engine.registry().is_empty().await);
        assert!(h.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_rejects_non_finite_metadata() {
        let h = harness();
        let metadata = Metadata::from([("odds".to_string(), MetadataValue::Float(f64::NAN))]);

        assert!(matches!(
            h.engine.start(dec!(1.0), "entry", metadata).await,
            Err(PaymentError::Validation(_))
        ));
        assert!(h.engine.registry().is_empty().await);
        assert!(h.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_registers_and_records_created() {
        let h = harness();
        let id = h.engine.start(dec!(1.0), "entry", Metadata::new()).await.unwrap();

        let intent = h.engine.intent(id).await.unwrap();
        assert_eq!(intent.status(), PaymentStatus::Created);
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::Created);
    }

    #[tokio::test]
    async fn test_start_requests_wallet_payment() {
        let h = harness();
        let id = h.engine.start(dec!(2.5), "entry", Metadata::new()).await.unwrap();

        for _ in 0..100 {
            if !h.gateway.requests().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let requests = h.gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].internal_id, id);
        assert_eq!(requests[0].amount.value(), dec!(2.5));
    }

    #[tokio::test]
    async fn test_approval_then_completion() {
        let h = harness();
        let id = issued(&h, "E1").await;

        let decision = h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();
        assert_eq!(decision, GatewayDecision::Approved);
        assert_eq!(h.engine.intent(id).await.unwrap().status(), PaymentStatus::Approved);

        let decision = h
            .engine
            .on_ready_for_completion(&ext("E1"), "tx123")
            .await
            .unwrap();
        assert_eq!(decision, GatewayDecision::Completed);
        assert!(h.engine.intent(id).await.is_none());

        let entry = h.ledger.get(id).await.unwrap().unwrap();
        assert_eq!(entry.projection.status(), PaymentStatus::Completed);
        assert_eq!(entry.projection.settlement_reference(), Some("tx123"));
    }

    #[tokio::test]
    async fn test_repeated_approval_event_is_idempotent() {
        let h = harness();
        let id = issued(&h, "E1").await;

        h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();
        let again = h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();
        assert_eq!(again, GatewayDecision::Approved);
        assert_eq!(h.approvals.calls(id), 1);
    }

    #[tokio::test]
    async fn test_denied_approval_fails_without_retry() {
        let h = harness();
        let id = issued(&h, "E1").await;
        h.approvals.push(id, ScriptedOutcome::Deny("sold out".into()));

        let decision = h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();
        assert_eq!(
            decision,
            GatewayDecision::Rejected {
                reason: "denied: sold out".into()
            }
        );
        assert_eq!(h.approvals.calls(id), 1);
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let h = harness();
        let id = issued(&h, "E1").await;
        for _ in 0..4 {
            h.approvals.push(id, ScriptedOutcome::Transient("timeout".into()));
        }

        let decision = h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();
        assert!(!decision.is_accepted());
        assert_eq!(h.approvals.calls(id), 4);

        let entry = h.ledger.get(id).await.unwrap().unwrap();
        assert_eq!(entry.projection.status(), PaymentStatus::Failed);
        assert_eq!(entry.projection.attempts(), 3);
    }

    #[tokio::test]
    async fn test_empty_settlement_reference_is_rejected() {
        let h = harness();
        let id = issued(&h, "E1").await;
        h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();

        assert!(matches!(
            h.engine.on_ready_for_completion(&ext("E1"), "").await,
            Err(PaymentError::Validation(_))
        ));
        assert_eq!(h.engine.intent(id).await.unwrap().status(), PaymentStatus::Approved);
    }

    #[tokio::test]
    async fn test_unknown_payment_is_reported_before_reference_check() {
        let h = harness();
        assert!(matches!(
            h.engine.on_ready_for_completion(&ext("nope"), "").await,
            Err(PaymentError::UnknownPayment(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_before_approval_is_invalid() {
        let h = harness();
        issued(&h, "E1").await;
        assert!(matches!(
            h.engine.on_ready_for_completion(&ext("E1"), "tx").await,
            Err(PaymentError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_gateway_cancel_and_late_events() {
        let h = harness();
        let id = issued(&h, "E1").await;

        h.engine.on_cancel(&ext("E1")).await.unwrap();
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::Cancelled);
        assert!(h.engine.intent(id).await.is_none());

        // Already ended: no-ops.
        h.engine.on_cancel(&ext("E1")).await.unwrap();
        h.engine.on_error(&ext("E1"), "late").await.unwrap();
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::Cancelled);

        assert!(matches!(
            h.engine.on_cancel(&ext("nope")).await,
            Err(PaymentError::UnknownPayment(_))
        ));
    }

    #[tokio::test]
    async fn test_caller_cancel() {
        let h = harness();
        let id = issued(&h, "E1").await;

        h.engine.cancel(id).await.unwrap();
        assert_eq!(h.gateway.cancellations(), vec![ext("E1")]);
        assert!(matches!(
            h.engine.cancel(id).await,
            Err(PaymentError::InvalidState {
                status: PaymentStatus::Cancelled,
                ..
            })
        ));
        assert!(matches!(
            h.engine.cancel(InternalId::new()).await,
            Err(PaymentError::UnknownPayment(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_external_id_is_refused() {
        let h = harness();
        issued(&h, "E1").await;
        let other = h.engine.start(dec!(1.0), "entry", Metadata::new()).await.unwrap();

        assert!(matches!(
            h.engine.on_external_id_issued(other, ext("E1")).await,
            Err(PaymentError::InvariantViolation(_))
        ));
        assert_eq!(h.engine.intent(other).await.unwrap().status(), PaymentStatus::Created);
    }

    #[tokio::test]
    async fn test_sweep_times_out_expired_intents_once() {
        let h = harness();
        let id = h.engine.start(dec!(1.0), "entry", Metadata::new()).await.unwrap();

        assert!(h.engine.sweep_timeouts().await.is_empty());
        h.clock.advance(Duration::from_secs(301));

        assert_eq!(h.engine.sweep_timeouts().await, vec![id]);
        assert!(h.engine.sweep_timeouts().await.is_empty());
        assert!(h.engine.registry().lookup_by_internal(id).await.is_none());
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_failed_ledger_write_does_not_stall_approval() {
        let h = harness();
        let id = issued(&h, "E1").await;
        h.ledger_failures.store(1, Ordering::SeqCst);

        let decision = h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();
        assert_eq!(decision, GatewayDecision::Approved);
        assert_eq!(h.approvals.calls(id), 1);
        assert_eq!(h.engine.intent(id).await.unwrap().status(), PaymentStatus::Approved);
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::Approved);
    }

    #[tokio::test]
    async fn test_failed_ledger_writes_do_not_stall_completion() {
        let h = harness();
        let id = issued(&h, "E1").await;
        h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();
        // pending_completion and completing are both lost.
        h.ledger_failures.store(2, Ordering::SeqCst);

        let decision = h
            .engine
            .on_ready_for_completion(&ext("E1"), "tx123")
            .await
            .unwrap();
        assert_eq!(decision, GatewayDecision::Completed);
        assert_eq!(h.completions.calls(id), 1);
        assert!(h.engine.intent(id).await.is_none());
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_sweep_records_terminal_write_that_failed() {
        let h = harness();
        let id = issued(&h, "E1").await;
        let mut events = h.engine.subscribe_to(id);
        h.ledger_failures.store(1, Ordering::SeqCst);

        h.engine.on_cancel(&ext("E1")).await.unwrap();
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::PendingApproval);
        // Still held, and already ended.
        assert_eq!(h.engine.intent(id).await.unwrap().status(), PaymentStatus::Cancelled);
        h.engine.on_error(&ext("E1"), "late").await.unwrap();

        assert!(h.engine.sweep_timeouts().await.is_empty());
        assert_eq!(ledger_status(&h, id).await, PaymentStatus::Cancelled);
        assert!(h.engine.intent(id).await.is_none());
        assert!(h.engine.registry().retired(&ext("E1")).await.is_some());

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, PaymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_events_follow_ledger_writes() {
        let h = harness();
        let mut events = h.engine.subscribe();
        let id = issued(&h, "E1").await;

        let created = events.recv().await.unwrap();
        assert_eq!((created.internal_id, created.status), (id, PaymentStatus::Created));
        let pending = events.recv().await.unwrap();
        assert_eq!(pending.status, PaymentStatus::PendingApproval);

        h.engine.on_ready_for_approval(&ext("E1")).await.unwrap();
        assert_eq!(events.recv().await.unwrap().status, PaymentStatus::Approving);
        assert_eq!(events.recv().await.unwrap().status, PaymentStatus::Approved);
    }
}
