use crate::domain::intent::{InternalId, PaymentIntent};
use crate::domain::ledger::LedgerEntry;
use crate::domain::ports::{ClockRef, LedgerStore};
use crate::error::Result;
use crate::infrastructure::clock::SystemClock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory ledger.
///
/// Uses `Arc<RwLock<HashMap<InternalId, LedgerEntry>>>` so clones share the same records.
/// Ideal for testing or for hosts that keep the audit trail elsewhere.
#[derive(Clone)]
pub struct InMemoryLedgerStore {
    entries: Arc<RwLock<HashMap<InternalId, LedgerEntry>>>,
    clock: ClockRef,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty ledger stamped with wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: ClockRef) -> Self {
        Self {
            entries: Arc::default(),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn upsert(&self, projection: PaymentIntent) -> Result<LedgerEntry> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let id = projection.internal_id();
        let entry = LedgerEntry::upsert(entries.remove(&id), projection, now);
        entries.insert(id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, internal_id: InternalId) -> Result<Option<LedgerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&internal_id).cloned())
    }

    async fn scan_non_terminal_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.is_orphan_candidate(older_than))
            .cloned()
            .collect())
    }
}
