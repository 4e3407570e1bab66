use super::intent::PaymentIntent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored projection plus the timestamps the ledger assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub projection: PaymentIntent,
    /// When the ledger first saw this intent.
    pub created_at: DateTime<Utc>,
    /// When the ledger accepted the latest projection.
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Merges `projection` into an existing entry, assigning ledger time `now`.
    ///
    /// A projection older than the stored one is ignored so the record only moves forward.
    pub fn upsert(existing: Option<LedgerEntry>, projection: PaymentIntent, now: DateTime<Utc>) -> Self {
        match existing {
            Some(entry) if entry.projection.version() >= projection.version() => entry,
            Some(entry) => Self {
                projection,
                created_at: entry.created_at,
                updated_at: now,
            },
            None => Self {
                projection,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn is_orphan_candidate(&self, older_than: DateTime<Utc>) -> bool {
        !self.projection.is_terminal() && self.created_at < older_than
    }
}
