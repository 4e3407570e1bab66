use crate::domain::intent::{InternalId, PaymentIntent};
use crate::domain::ledger::LedgerEntry;
use crate::domain::ports::{ClockRef, LedgerStore};
use crate::error::{PaymentError, Result};
use crate::infrastructure::clock::SystemClock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, DB, Options};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family holding one JSON-encoded `LedgerEntry` per payment intent.
pub const CF_INTENTS: &str = "intents";

/// A persistent ledger implementation using RocksDB.
///
/// Entries are keyed by the 16 raw bytes of the internal id. Upserts are read-modify-write,
/// serialized through `write_lock` so two writers cannot interleave on the same key.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbLedgerStore {
    db: Arc<DB>,
    clock: ClockRef,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDbLedgerStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the "intents" column family exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock<P: AsRef<Path>>(path: P, clock: ClockRef) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_intents = ColumnFamilyDescriptor::new(CF_INTENTS, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_intents])?;

        Ok(Self {
            db: Arc::new(db),
            clock,
            write_lock: Arc::default(),
        })
    }

    fn read(&self, internal_id: InternalId) -> Result<Option<LedgerEntry>> {
        let cf = self.intents_cf()?;
        match self.db.get_cf(cf, internal_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn intents_cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_INTENTS)
            .ok_or_else(|| PaymentError::Storage("Intents column family not found".to_string()))
    }
}

#[async_trait]
impl LedgerStore for RocksDbLedgerStore {
    async fn upsert(&self, projection: PaymentIntent) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;
        let id = projection.internal_id();
        let entry = LedgerEntry::upsert(self.read(id)?, projection, self.clock.now());

        let cf = self.intents_cf()?;
        self.db
            .put_cf(cf, id.as_bytes(), serde_json::to_vec(&entry)?)?;
        Ok(entry)
    }

    async fn get(&self, internal_id: InternalId) -> Result<Option<LedgerEntry>> {
        self.read(internal_id)
    }

    async fn scan_non_terminal_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let cf = self.intents_cf()?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            let entry: LedgerEntry = serde_json::from_slice(&value)?;
            if entry.is_orphan_candidate(older_than) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::intent::{Amount, Memo, Metadata, Transition};
    use crate::domain::ports::Clock;
    use crate::domain::status::PaymentStatus;
    use crate::infrastructure::clock::ManualClock;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tempfile::tempdir;

    fn intent() -> PaymentIntent {
        PaymentIntent::new(
            Amount::new(dec!(3.14)).unwrap(),
            Memo::new("Lottery entry").unwrap(),
            Metadata::from([("lotteryTypeId".to_string(), "weekly".into())]),
            Utc::now(),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDbLedgerStore::open(dir.path()).expect("Failed to open RocksDB");
        assert!(store.db.cf_handle(CF_INTENTS).is_some());
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_upsert_and_get() {
        let dir = tempdir().unwrap();
        let store = RocksDbLedgerStore::open(dir.path()).unwrap();
        let intent = intent();

        store.upsert(intent.clone()).await.unwrap();
        let retrieved = store.get(intent.internal_id()).await.unwrap().unwrap();
        assert_eq!(retrieved.projection, intent);

        assert!(store.get(InternalId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let intent = intent();
        {
            let store = RocksDbLedgerStore::open(dir.path()).unwrap();
            store.upsert(intent.clone()).await.unwrap();
        }

        let store = RocksDbLedgerStore::open(dir.path()).unwrap();
        let retrieved = store.get(intent.internal_id()).await.unwrap().unwrap();
        assert_eq!(retrieved.projection.amount(), intent.amount());
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_scan_skips_terminal() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = RocksDbLedgerStore::open_with_clock(dir.path(), clock.clone()).unwrap();

        let open = intent();
        let mut done = intent();
        done.apply(PaymentStatus::Created, Transition::TimeOut, clock.now())
            .unwrap();
        store.upsert(open.clone()).await.unwrap();
        store.upsert(done).await.unwrap();

        clock.advance(Duration::from_secs(10));
        let found = store
            .scan_non_terminal_older_than(clock.now())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].projection.internal_id(), open.internal_id());
    }
}
