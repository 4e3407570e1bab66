use crate::domain::intent::{ExternalId, InternalId, PaymentIntent};
use crate::domain::status::PaymentStatus;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// One active intent plus the locks that serialize access to it.
///
/// `state` guards status, attempts and bindings. `persist` only orders ledger writes of
/// this intent; it is never held together with `state` across I/O.
#[derive(Debug)]
pub struct IntentHandle {
    internal_id: InternalId,
    deadline: DateTime<Utc>,
    state: Mutex<PaymentIntent>,
    persist: Mutex<()>,
}

impl IntentHandle {
    fn new(intent: PaymentIntent) -> Self {
        Self {
            internal_id: intent.internal_id(),
            deadline: intent.timeout_deadline(),
            state: Mutex::new(intent),
            persist: Mutex::new(()),
        }
    }

    pub fn internal_id(&self) -> InternalId {
        self.internal_id
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub async fn snapshot(&self) -> PaymentIntent {
        self.state.lock().await.clone()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, PaymentIntent> {
        self.state.lock().await
    }

    pub(crate) async fn lock_persist(&self) -> MutexGuard<'_, ()> {
        self.persist.lock().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredIntent {
    pub internal_id: InternalId,
    pub status: PaymentStatus,
    until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Index {
    by_internal: HashMap<InternalId, Arc<IntentHandle>>,
    by_external: HashMap<ExternalId, InternalId>,
    external_of: HashMap<InternalId, ExternalId>,
    retired: HashMap<ExternalId, RetiredIntent>,
    unrecorded: HashSet<InternalId>,
}

/// Index of all active intents, keyed by internal id and, once issued, by external id.
///
/// Every operation is a plain map mutation under one `RwLock`; no persistence and no
/// per-intent locks are touched while it is held.
#[derive(Debug, Default)]
pub struct PaymentRegistry {
    index: RwLock<Index>,
}

impl PaymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, intent: PaymentIntent) -> Result<Arc<IntentHandle>> {
        let mut index = self.index.write().await;
        let id = intent.internal_id();
        if index.by_internal.contains_key(&id) {
            return Err(PaymentError::InvariantViolation(format!(
                "payment {id} is already registered"
            )));
        }
        let handle = Arc::new(IntentHandle::new(intent));
        index.by_internal.insert(id, handle.clone());
        Ok(handle)
    }

    /// Binds `external_id` to an active intent.
    ///
    /// Re-binding the same pair is a no-op. Fails with `InvariantViolation` when another
    /// active intent already holds the external id or the intent is bound to a different one.
    pub async fn bind_external_id(
        &self,
        internal_id: InternalId,
        external_id: ExternalId,
    ) -> Result<Arc<IntentHandle>> {
        let mut index = self.index.write().await;
        let handle = index
            .by_internal
            .get(&internal_id)
            .cloned()
            .ok_or_else(|| PaymentError::UnknownPayment(internal_id.to_string()))?;

        if let Some(holder) = index.by_external.get(&external_id) {
            if *holder == internal_id {
                return Ok(handle);
            }
            return Err(PaymentError::InvariantViolation(format!(
                "external id {external_id} is already held by payment {holder}"
            )));
        }
        if let Some(bound) = index.external_of.get(&internal_id) {
            return Err(PaymentError::InvariantViolation(format!(
                "payment {internal_id} is already bound to {bound}"
            )));
        }

        index.by_external.insert(external_id.clone(), internal_id);
        index.external_of.insert(internal_id, external_id);
        Ok(handle)
    }

    pub async fn lookup_by_external(&self, external_id: &ExternalId) -> Option<Arc<IntentHandle>> {
        let index = self.index.read().await;
        index
            .by_external
            .get(external_id)
            .and_then(|id| index.by_internal.get(id))
            .cloned()
    }

    pub async fn lookup_by_internal(&self, internal_id: InternalId) -> Option<Arc<IntentHandle>> {
        self.index.read().await.by_internal.get(&internal_id).cloned()
    }

    pub async fn unregister(&self, internal_id: InternalId) -> Option<Arc<IntentHandle>> {
        let mut index = self.index.write().await;
        if let Some(external_id) = index.external_of.remove(&internal_id) {
            index.by_external.remove(&external_id);
        }
        index.unrecorded.remove(&internal_id);
        index.by_internal.remove(&internal_id)
    }

    /// Unregisters a terminal intent and remembers its external id until `until`.
    ///
    /// Retired ids whose retention ended by `now` are forgotten on the way.
    pub async fn retire(
        &self,
        internal_id: InternalId,
        status: PaymentStatus,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<Arc<IntentHandle>> {
        let mut index = self.index.write().await;
        index.retired.retain(|_, r| r.until > now);
        index.unrecorded.remove(&internal_id);
        if let Some(external_id) = index.external_of.remove(&internal_id) {
            index.by_external.remove(&external_id);
            index.retired.insert(
                external_id,
                RetiredIntent {
                    internal_id,
                    status,
                    until,
                },
            );
        }
        index.by_internal.remove(&internal_id)
    }

    pub async fn retired(&self, external_id: &ExternalId) -> Option<RetiredIntent> {
        self.index.read().await.retired.get(external_id).copied()
    }

    /// Keeps an ended intent registered until its terminal ledger write succeeds.
    pub async fn hold_unrecorded(&self, internal_id: InternalId) {
        let mut index = self.index.write().await;
        if index.by_internal.contains_key(&internal_id) {
            index.unrecorded.insert(internal_id);
        }
    }

    /// Ended intents whose terminal ledger write has not gone through yet.
    pub async fn unrecorded(&self) -> Vec<Arc<IntentHandle>> {
        let index = self.index.read().await;
        index
            .unrecorded
            .iter()
            .filter_map(|id| index.by_internal.get(id))
            .cloned()
            .collect()
    }

    /// Active intents whose deadline is at or before `now`.
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<Arc<IntentHandle>> {
        self.index
            .read()
            .await
            .by_internal
            .values()
            .filter(|h| h.deadline() <= now)
            .cloned()
            .collect()
    }

    /// Forgets retired external ids whose retention ended. Returns how many were dropped.
    pub async fn prune_retired(&self, now: DateTime<Utc>) -> usize {
        let mut index = self.index.write().await;
        let before = index.retired.len();
        index.retired.retain(|_, r| r.until > now);
        before - index.retired.len()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.by_internal.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.by_internal.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::intent::{Amount, Memo, Metadata};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn intent(now: DateTime<Utc>, timeout: Duration) -> PaymentIntent {
        PaymentIntent::new(
            Amount::new(dec!(1.0)).unwrap(),
            Memo::new("entry").unwrap(),
            Metadata::new(),
            now,
            timeout,
        )
    }

    fn ext(id: &str) -> ExternalId {
        ExternalId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = PaymentRegistry::new();
        let intent = intent(Utc::now(), Duration::from_secs(60));
        let id = intent.internal_id();

        registry.register(intent.clone()).await.unwrap();
        assert!(registry.lookup_by_internal(id).await.is_some());
        assert!(matches!(
            registry.register(intent).await,
            Err(PaymentError::InvariantViolation(_))
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_bind_external_id() {
        let registry = PaymentRegistry::new();
        let a = intent(Utc::now(), Duration::from_secs(60));
        let b = intent(Utc::now(), Duration::from_secs(60));
        let (a_id, b_id) = (a.internal_id(), b.internal_id());
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();

        registry.bind_external_id(a_id, ext("E1")).await.unwrap();
        // Same pair again is fine.
        registry.bind_external_id(a_id, ext("E1")).await.unwrap();

        let found = registry.lookup_by_external(&ext("E1")).await.unwrap();
        assert_eq!(found.internal_id(), a_id);

        assert!(matches!(
            registry.bind_external_id(b_id, ext("E1")).await,
            Err(PaymentError::InvariantViolation(_))
        ));
        assert!(matches!(
            registry.bind_external_id(a_id, ext("E2")).await,
            Err(PaymentError::InvariantViolation(_))
        ));
        assert!(matches!(
            registry.bind_external_id(InternalId::new(), ext("E3")).await,
            Err(PaymentError::UnknownPayment(_))
        ));
    }

    #[tokio::test]
    async fn test_external_id_is_reusable_after_unregister() {
        let registry = PaymentRegistry::new();
        let a = intent(Utc::now(), Duration::from_secs(60));
        let b = intent(Utc::now(), Duration::from_secs(60));
        let (a_id, b_id) = (a.internal_id(), b.internal_id());
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();

        registry.bind_external_id(a_id, ext("E1")).await.unwrap();
        registry.unregister(a_id).await.unwrap();
        assert!(registry.lookup_by_external(&ext("E1")).await.is_none());

        registry.bind_external_id(b_id, ext("E1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_retire_remembers_external_id_until_pruned() {
        let now = Utc::now();
        let registry = PaymentRegistry::new();
        let a = intent(now, Duration::from_secs(60));
        let a_id = a.internal_id();
        registry.register(a).await.unwrap();
        registry.bind_external_id(a_id, ext("E1")).await.unwrap();

        let until = now + chrono::Duration::seconds(30);
        registry.retire(a_id, PaymentStatus::Cancelled, now, until).await;
        assert!(registry.lookup_by_internal(a_id).await.is_none());

        let retired = registry.retired(&ext("E1")).await.unwrap();
        assert_eq!(retired.internal_id, a_id);
        assert_eq!(retired.status, PaymentStatus::Cancelled);

        assert_eq!(registry.prune_retired(now).await, 0);
        assert_eq!(registry.prune_retired(until).await, 1);
        assert!(registry.retired(&ext("E1")).await.is_none());
    }

    #[tokio::test]
    async fn test_retire_forgets_ids_whose_retention_ended() {
        let now = Utc::now();
        let registry = PaymentRegistry::new();
        let a = intent(now, Duration::from_secs(60));
        let b = intent(now, Duration::from_secs(60));
        let (a_id, b_id) = (a.internal_id(), b.internal_id());
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();
        registry.bind_external_id(a_id, ext("E1")).await.unwrap();
        registry.bind_external_id(b_id, ext("E2")).await.unwrap();

        let retention = chrono::Duration::seconds(30);
        registry
            .retire(a_id, PaymentStatus::Cancelled, now, now + retention)
            .await;

        // No prune_retired call in between.
        let later = now + chrono::Duration::seconds(31);
        registry
            .retire(b_id, PaymentStatus::Completed, later, later + retention)
            .await;

        assert!(registry.retired(&ext("E1")).await.is_none());
        assert_eq!(
            registry.retired(&ext("E2")).await.unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_unrecorded_intents_stay_until_retired() {
        let now = Utc::now();
        let registry = PaymentRegistry::new();
        let a = intent(now, Duration::from_secs(60));
        let a_id = a.internal_id();
        registry.register(a).await.unwrap();

        registry.hold_unrecorded(a_id).await;
        // Unknown ids are ignored.
        registry.hold_unrecorded(InternalId::new()).await;
        let held = registry.unrecorded().await;
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].internal_id(), a_id);

        registry.retire(a_id, PaymentStatus::Failed, now, now).await;
        assert!(registry.unrecorded().await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_selects_by_deadline() {
        let now = Utc::now();
        let registry = PaymentRegistry::new();
        let short = intent(now, Duration::from_secs(1));
        let long = intent(now, Duration::from_secs(60));
        let short_id = short.internal_id();
        registry.register(short).await.unwrap();
        registry.register(long).await.unwrap();

        assert!(registry.expired(now).await.is_empty());
        let expired = registry.expired(now + chrono::Duration::seconds(1)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].internal_id(), short_id);
    }
}
