//! Backing store interface and the in-memory reference store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::lease::{LeaseKey, LeaseRecord, Trapdoor};
use crate::utils::LeaseError;

use async_trait::async_trait;

use tokio::time::Duration;

/// Result of a successful store claim round-trip.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ClaimOutcome {
    /// Claim created or extended; carries the record now in the store.
    Granted(LeaseRecord),

    /// Someone else holds the lease; carries their current record.
    Denied(LeaseRecord),
}

/// Durable, transactional backing of lease records shared by every manager
/// instance. Each operation must be atomic; the store is the only place
/// cross-process mutual exclusion is decided.
#[async_trait]
pub trait LeaseStore: fmt::Debug + Send + Sync + 'static {
    /// Creates the lease for `holder` if absent, or extends it if `holder`
    /// already holds it. Extension never shortens the current expiry.
    async fn claim_or_extend(
        &self,
        key: &LeaseKey,
        holder: &str,
        start: SystemTime,
        duration: Duration,
    ) -> Result<ClaimOutcome, LeaseError>;

    /// Removes the lease if `holder` holds it; `NotHeld` otherwise.
    async fn revoke(&self, key: &LeaseKey, holder: &str)
        -> Result<(), LeaseError>;

    /// Adds `entity` to the lease's pins; `NotHeld` if the lease is absent.
    async fn pin(
        &self,
        key: &LeaseKey,
        entity: &str,
    ) -> Result<LeaseRecord, LeaseError>;

    /// Removes `entity` from the lease's pins. Returns the lease's record, or
    /// `None` if the lease is absent.
    async fn unpin(
        &self,
        key: &LeaseKey,
        entity: &str,
    ) -> Result<Option<LeaseRecord>, LeaseError>;

    /// Removes every unpinned lease with expiry at or before `now`, returning
    /// their keys.
    async fn expire_due(
        &self,
        now: SystemTime,
    ) -> Result<Vec<LeaseKey>, LeaseError>;

    /// Full snapshot of all lease records.
    async fn read_all(
        &self,
    ) -> Result<HashMap<LeaseKey, LeaseRecord>, LeaseError>;
}

/// Lease table semantics shared by the in-memory and file-backed stores.
pub(crate) type LeaseTable = HashMap<LeaseKey, LeaseRecord>;

pub(crate) fn table_claim(
    table: &mut LeaseTable,
    key: &LeaseKey,
    holder: &str,
    start: SystemTime,
    duration: Duration,
) -> ClaimOutcome {
    match table.get_mut(key) {
        None => {
            let record = LeaseRecord::new(holder, start, duration);
            table.insert(key.clone(), record.clone());
            ClaimOutcome::Granted(record)
        }
        Some(record) if record.holder == holder => {
            // only move expiry forwards; pins survive extension
            if LeaseRecord::new(holder, start, duration).expiry()
                > record.expiry()
            {
                record.start = start;
                record.duration = duration;
            }
            ClaimOutcome::Granted(record.clone())
        }
        Some(record) => ClaimOutcome::Denied(record.clone()),
    }
}

pub(crate) fn table_revoke(
    table: &mut LeaseTable,
    key: &LeaseKey,
    holder: &str,
) -> Result<(), LeaseError> {
    if !table.get(key).map_or(false, |record| record.holder == holder) {
        return Err(LeaseError::NotHeld);
    }
    table.remove(key);
    Ok(())
}

pub(crate) fn table_pin(
    table: &mut LeaseTable,
    key: &LeaseKey,
    entity: &str,
) -> Result<LeaseRecord, LeaseError> {
    match table.get_mut(key) {
        Some(record) => {
            record.pinned_by.insert(entity.into());
            Ok(record.clone())
        }
        None => Err(LeaseError::NotHeld),
    }
}

pub(crate) fn table_unpin(
    table: &mut LeaseTable,
    key: &LeaseKey,
    entity: &str,
) -> Option<LeaseRecord> {
    table.get_mut(key).map(|record| {
        record.pinned_by.remove(entity);
        record.clone()
    })
}

pub(crate) fn table_expire(
    table: &mut LeaseTable,
    now: SystemTime,
) -> Vec<LeaseKey> {
    let mut expired: Vec<LeaseKey> = table
        .iter()
        .filter(|(_, record)| record.is_reapable(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        table.remove(key);
    }
    expired.sort();
    expired
}

#[derive(Debug, Default)]
struct MemStoreState {
    table: LeaseTable,
    unavailable: bool,
}

/// In-memory lease store. Clones share the same table, which lets several
/// manager instances in one process behave like separate controllers over a
/// single store.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    state: Arc<Mutex<MemStoreState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the store going down (`false`) or coming back (`true`).
    /// While down every operation fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = !available;
        }
    }

    /// Re-verifies a token trapdoor against the store's current state, the
    /// way an embedding transaction would assert it.
    pub fn verify_trapdoor(&self, trapdoor: &Trapdoor) -> Result<(), LeaseError> {
        let state = self.lock()?;
        match state.table.get(&trapdoor.key) {
            Some(record) if record.holder == trapdoor.holder => Ok(()),
            _ => Err(LeaseError::NotHeld),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemStoreState>, LeaseError> {
        let state = self.state.lock().map_err(|e| {
            LeaseError::StoreUnavailable(format!("store lock poisoned: {}", e))
        })?;
        if state.unavailable {
            return Err(LeaseError::StoreUnavailable(
                "store is offline".into(),
            ));
        }
        Ok(state)
    }
}

#[async_trait]
impl LeaseStore for MemStore {
    async fn claim_or_extend(
        &self,
        key: &LeaseKey,
        holder: &str,
        start: SystemTime,
        duration: Duration,
    ) -> Result<ClaimOutcome, LeaseError> {
        let mut state = self.lock()?;
        Ok(table_claim(&mut state.table, key, holder, start, duration))
    }

    async fn revoke(
        &self,
        key: &LeaseKey,
        holder: &str,
    ) -> Result<(), LeaseError> {
        let mut state = self.lock()?;
        table_revoke(&mut state.table, key, holder)
    }

    async fn pin(
        &self,
        key: &LeaseKey,
        entity: &str,
    ) -> Result<LeaseRecord, LeaseError> {
        let mut state = self.lock()?;
        table_pin(&mut state.table, key, entity)
    }

    async fn unpin(
        &self,
        key: &LeaseKey,
        entity: &str,
    ) -> Result<Option<LeaseRecord>, LeaseError> {
        let mut state = self.lock()?;
        Ok(table_unpin(&mut state.table, key, entity))
    }

    async fn expire_due(
        &self,
        now: SystemTime,
    ) -> Result<Vec<LeaseKey>, LeaseError> {
        let mut state = self.lock()?;
        Ok(table_expire(&mut state.table, now))
    }

    async fn read_all(
        &self,
    ) -> Result<HashMap<LeaseKey, LeaseRecord>, LeaseError> {
        let state = self.lock()?;
        Ok(state.table.clone())
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn key() -> LeaseKey {
        LeaseKey::new("leadership", "mysql")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn claim_then_deny() -> Result<(), LeaseError> {
        let store = MemStore::new();
        let secs30 = Duration::from_secs(30);
        let outcome =
            store.claim_or_extend(&key(), "mysql/0", t(100), secs30).await?;
        assert_eq!(
            outcome,
            ClaimOutcome::Granted(LeaseRecord::new("mysql/0", t(100), secs30))
        );
        let outcome =
            store.claim_or_extend(&key(), "mysql/1", t(101), secs30).await?;
        assert_eq!(
            outcome,
            ClaimOutcome::Denied(LeaseRecord::new("mysql/0", t(100), secs30))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn extend_never_shortens() -> Result<(), LeaseError> {
        let store = MemStore::new();
        store
            .claim_or_extend(&key(), "mysql/0", t(100), Duration::from_secs(60))
            .await?;
        // shorter extension is accepted but leaves expiry alone
        let outcome = store
            .claim_or_extend(&key(), "mysql/0", t(110), Duration::from_secs(10))
            .await?;
        match outcome {
            ClaimOutcome::Granted(record) => {
                assert_eq!(record.expiry(), t(160))
            }
            _ => panic!("extension denied"),
        }
        // longer one moves it forwards
        let outcome = store
            .claim_or_extend(&key(), "mysql/0", t(150), Duration::from_secs(60))
            .await?;
        match outcome {
            ClaimOutcome::Granted(record) => {
                assert_eq!(record.expiry(), t(210))
            }
            _ => panic!("extension denied"),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn revoke_only_by_holder() -> Result<(), LeaseError> {
        let store = MemStore::new();
        assert_eq!(
            store.revoke(&key(), "mysql/0").await,
            Err(LeaseError::NotHeld)
        );
        store
            .claim_or_extend(&key(), "mysql/0", t(100), Duration::from_secs(30))
            .await?;
        assert_eq!(
            store.revoke(&key(), "mysql/1").await,
            Err(LeaseError::NotHeld)
        );
        store.revoke(&key(), "mysql/0").await?;
        assert!(store.read_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn pins_block_expiry() -> Result<(), LeaseError> {
        let store = MemStore::new();
        assert_eq!(
            store.pin(&key(), "migration-123").await,
            Err(LeaseError::NotHeld)
        );
        assert_eq!(store.unpin(&key(), "migration-123").await?, None);

        store
            .claim_or_extend(&key(), "mysql/0", t(100), Duration::from_secs(30))
            .await?;
        let other = LeaseKey::new("leadership", "redis");
        store
            .claim_or_extend(&other, "redis/0", t(100), Duration::from_secs(30))
            .await?;
        store.pin(&key(), "migration-123").await?;
        let record = store.pin(&key(), "migration-123").await?;
        assert_eq!(record.pinned_by.len(), 1);

        assert_eq!(store.expire_due(t(1000)).await?, vec![other.clone()]);
        assert_eq!(store.read_all().await?.len(), 1);

        let record = store.unpin(&key(), "backup-7").await?;
        assert!(record.map_or(false, |r| r.is_pinned()));
        let record = store.unpin(&key(), "migration-123").await?;
        assert!(record.map_or(false, |r| !r.is_pinned()));
        assert_eq!(store.expire_due(t(1000)).await?, vec![key()]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn overflowing_duration_reaped() -> Result<(), LeaseError> {
        let store = MemStore::new();
        store
            .claim_or_extend(&key(), "mysql/0", t(100), Duration::MAX)
            .await?;
        store
            .claim_or_extend(&key(), "mysql/0", t(101), Duration::MAX)
            .await?;
        assert_eq!(store.expire_due(t(100)).await?, vec![key()]);
        // the store stays usable afterwards
        assert!(store.read_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn offline_and_back() -> Result<(), LeaseError> {
        let store = MemStore::new();
        let shared = store.clone();
        shared.set_available(false);
        assert!(matches!(
            store.read_all().await,
            Err(LeaseError::StoreUnavailable(_))
        ));
        shared.set_available(true);
        assert!(store.read_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn trapdoor_verify() -> Result<(), LeaseError> {
        let store = MemStore::new();
        store
            .claim_or_extend(&key(), "mysql/0", t(100), Duration::from_secs(30))
            .await?;
        let trapdoor = Trapdoor {
            key: key(),
            holder: "mysql/0".into(),
        };
        assert_eq!(store.verify_trapdoor(&trapdoor), Ok(()));
        store.revoke(&key(), "mysql/0").await?;
        assert_eq!(store.verify_trapdoor(&trapdoor), Err(LeaseError::NotHeld));
        Ok(())
    }
}
