use crate::application::engine::PaymentEngine;
use crate::domain::event::IntentEvent;
use crate::domain::intent::{ApplyOutcome, Transition};
use crate::domain::ledger::LedgerEntry;
use crate::domain::status::PaymentStatus;
use crate::error::Result;
use tracing::{info, warn};

pub const ORPHANED_ON_RESTART: &str = "orphaned_on_restart";

impl PaymentEngine {
    /// Resolves intents a previous process left unfinished.
    ///
    /// The binding to the gateway's external id only lives in memory, so a non-terminal
    /// ledger record older than the payment timeout cannot be resumed. Each one is moved to
    /// `failed` with reason `orphaned_on_restart`. Intents this engine currently owns are
    /// left alone. Runs at startup and again on every timeout sweep, which picks up records
    /// that were still too young at startup.
    pub async fn recover_orphans(&self) -> Result<Vec<LedgerEntry>> {
        let now = self.now();
        let window = chrono::Duration::from_std(self.config().payment_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(now);

        let stale = self.ledger().scan_non_terminal_older_than(cutoff).await?;
        let mut resolved = Vec::with_capacity(stale.len());
        for entry in stale {
            let mut intent = entry.projection;
            let internal_id = intent.internal_id();
            if self.registry().lookup_by_internal(internal_id).await.is_some() {
                continue;
            }

            let from = intent.status();
            let transition = Transition::Fail {
                reason: ORPHANED_ON_RESTART.to_string(),
            };
            match intent.apply(from, transition, now) {
                Ok(ApplyOutcome::Applied) => {}
                Ok(outcome) => {
                    warn!(internal_id = %internal_id, ?outcome, "orphan left as is");
                    continue;
                }
                Err(e) => {
                    warn!(internal_id = %internal_id, error = %e, "orphan could not be failed");
                    continue;
                }
            }

            let entry = self.ledger().upsert(intent).await?;
            info!(internal_id = %internal_id, from = %from, "orphaned payment resolved as failed");
            self.events().publish(IntentEvent {
                internal_id,
                status: PaymentStatus::Failed,
                timestamp: now,
            });
            resolved.push(entry);
        }
        Ok(resolved)
    }
}
