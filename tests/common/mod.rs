#![allow(dead_code)]

use lottopay::application::engine::{EnginePorts, PaymentEngine};
use lottopay::application::retry::RetryPolicy;
use lottopay::config::EngineConfig;
use lottopay::domain::intent::{ExternalId, InternalId, Metadata};
use lottopay::domain::ports::LedgerStore;
use lottopay::domain::status::PaymentStatus;
use lottopay::infrastructure::clock::ManualClock;
use lottopay::infrastructure::in_memory::InMemoryLedgerStore;
use lottopay::infrastructure::scripted::{
    ScriptedApprovalService, ScriptedCompletionService, ScriptedGateway,
};
use rust_decimal_macros::dec;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

/// An engine wired to scripted services, an in-memory ledger and a manual clock.
pub struct Harness {
    pub engine: PaymentEngine,
    pub gateway: Arc<ScriptedGateway>,
    pub approvals: Arc<ScriptedApprovalService>,
    pub completions: Arc<ScriptedCompletionService>,
    pub ledger: InMemoryLedgerStore,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default().with_retry(RetryPolicy::immediate(3)))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_gateway(config, ScriptedGateway::new())
    }

    pub fn with_gateway(config: EngineConfig, gateway: ScriptedGateway) -> Self {
        let clock = Arc::new(ManualClock::default());
        let gateway = Arc::new(gateway);
        let approvals = Arc::new(ScriptedApprovalService::approving());
        let completions = Arc::new(ScriptedCompletionService::completing());
        let ledger = InMemoryLedgerStore::with_clock(clock.clone());
        let engine = PaymentEngine::new(
            EnginePorts {
                gateway: gateway.clone(),
                approvals: approvals.clone(),
                completions: completions.clone(),
                ledger: Arc::new(ledger.clone()),
                clock: clock.clone(),
            },
            config,
        );
        Self {
            engine,
            gateway,
            approvals,
            completions,
            ledger,
            clock,
        }
    }

    /// Starts a 1.0 payment and binds `external` to it.
    pub async fn issued(&self, external: &str) -> InternalId {
        let id = self
            .engine
            .start(dec!(1.0), "Lottery entry", Metadata::new())
            .await
            .unwrap();
        self.engine
            .on_external_id_issued(id, ext(external))
            .await
            .unwrap();
        id
    }

    pub async fn ledger_status(&self, id: InternalId) -> PaymentStatus {
        self.ledger
            .get(id)
            .await
            .unwrap()
            .expect("ledger entry")
            .projection
            .status()
    }
}

pub fn ext(id: &str) -> ExternalId {
    ExternalId::new(id).unwrap()
}

/// Writes a replay script with the standard header followed by `rows`.
pub fn write_script(path: &Path, rows: &[[&str; 6]]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["type", "payment", "amount", "memo", "reference", "outcome"])?;
    for row in rows {
        wtr.write_record(row)?;
    }

    wtr.flush()?;
    Ok(())
}
