//! Coordinator-owned snapshot of lease records, plus the read-only view of
//! it handed out to tokens.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::lease::{LeaseKey, LeaseRecord};
use crate::utils::LeaseError;

/// What a token needs to know about a lease, kept small so that checks never
/// allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CachedLease {
    holder: String,
    expiry: SystemTime,
    pinned: bool,
}

impl From<&LeaseRecord> for CachedLease {
    fn from(record: &LeaseRecord) -> Self {
        CachedLease {
            holder: record.holder.clone(),
            expiry: record.expiry(),
            pinned: record.is_pinned(),
        }
    }
}

/// The cache of every lease this manager knows about.
///
/// Owned and mutated only by the coordinator task. Each mutation is
/// published to readers through a flashmap write handle and bumps the shared
/// version counter.
pub(crate) struct LeaseCache {
    /// Authoritative copy used by the coordinator itself.
    entries: HashMap<LeaseKey, LeaseRecord>,

    /// Write side of the view shared with tokens.
    view: flashmap::WriteHandle<LeaseKey, CachedLease>,

    /// Bumped after every published change.
    version: Arc<AtomicU64>,
}

impl LeaseCache {
    /// Creates a cache seeded with a store snapshot, returning it together
    /// with the first reader view.
    pub(crate) fn new(
        snapshot: HashMap<LeaseKey, LeaseRecord>,
    ) -> (Self, CacheView) {
        let (view_write, view_read) = flashmap::new::<LeaseKey, CachedLease>();
        let version = Arc::new(AtomicU64::new(0));

        let mut cache = LeaseCache {
            entries: HashMap::new(),
            view: view_write,
            version: version.clone(),
        };
        cache.replace_all(snapshot);

        (
            cache,
            CacheView {
                view: view_read,
                version,
            },
        )
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self, key: &LeaseKey) -> Option<&LeaseRecord> {
        self.entries.get(key)
    }

    /// Records of one namespace, keyed by lease name.
    pub(crate) fn namespace_snapshot(
        &self,
        namespace: &str,
    ) -> HashMap<String, LeaseRecord> {
        self.entries
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(key, record)| (key.name.clone(), record.clone()))
            .collect()
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Inserts or replaces the record of a lease.
    pub(crate) fn upsert(&mut self, key: LeaseKey, record: LeaseRecord) {
        if self.entries.get(&key) == Some(&record) {
            return;
        }
        self.view.guard().insert(key.clone(), CachedLease::from(&record));
        self.entries.insert(key, record);
        self.bump();
    }

    /// Removes the given leases, returning those that were present.
    pub(crate) fn remove_many(&mut self, keys: &[LeaseKey]) -> Vec<LeaseKey> {
        let removed: Vec<LeaseKey> = keys
            .iter()
            .filter(|key| self.entries.remove(*key).is_some())
            .cloned()
            .collect();
        if removed.is_empty() {
            return removed;
        }

        {
            let mut guard = self.view.guard();
            for key in &removed {
                guard.remove(key.clone());
            }
        } // changes published here
        self.bump();
        removed
    }

    /// Removes a single lease, returning true if it was present.
    pub(crate) fn remove(&mut self, key: &LeaseKey) -> bool {
        !self.remove_many(std::slice::from_ref(key)).is_empty()
    }

    /// Replaces the whole content with a fresh store snapshot. Returns the
    /// keys that disappeared.
    pub(crate) fn replace_all(
        &mut self,
        snapshot: HashMap<LeaseKey, LeaseRecord>,
    ) -> Vec<LeaseKey> {
        let vanished: Vec<LeaseKey> = self
            .entries
            .keys()
            .filter(|key| !snapshot.contains_key(*key))
            .cloned()
            .collect();
        let changed: Vec<(LeaseKey, CachedLease)> = snapshot
            .iter()
            .filter(|(key, record)| self.entries.get(*key) != Some(*record))
            .map(|(key, record)| (key.clone(), CachedLease::from(record)))
            .collect();
        if vanished.is_empty() && changed.is_empty() {
            return vanished;
        }

        {
            let mut guard = self.view.guard();
            for key in &vanished {
                guard.remove(key.clone());
            }
            for (key, lease) in changed {
                guard.insert(key, lease);
            }
        } // changes published here
        self.entries = snapshot;
        self.bump();
        vanished
    }
}

/// Read-only view of the cache used by checkers and tokens. Reads never
/// block on the coordinator.
///
/// The view is `Send` but not `Sync`: clone it for every task that needs
/// one.
#[derive(Clone)]
pub(crate) struct CacheView {
    view: flashmap::ReadHandle<LeaseKey, CachedLease>,
    version: Arc<AtomicU64>,
}

impl fmt::Debug for CacheView {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CacheView")
            .field("version", &self.version())
            .finish()
    }
}

impl CacheView {
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Checks that `holder` currently holds `key` and, unless pinned, that
    /// the lease has not expired as of `now`.
    pub(crate) fn check(
        &self,
        key: &LeaseKey,
        holder: &str,
        now: SystemTime,
    ) -> Result<(), LeaseError> {
        let guard = self.view.guard();
        match guard.get(key) {
            Some(lease) if lease.holder == holder => {
                if !lease.pinned && lease.expiry <= now {
                    Err(LeaseError::LeaseExpired)
                } else {
                    Ok(())
                }
            }
            _ => Err(LeaseError::NotHeld),
        }
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use tokio::time::Duration;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn record(holder: &str) -> LeaseRecord {
        LeaseRecord::new(holder, t(100), Duration::from_secs(30))
    }

    #[test]
    fn seeded_from_snapshot() {
        let key = LeaseKey::new("leadership", "mysql");
        let snapshot = HashMap::from([(key.clone(), record("mysql/0"))]);
        let (cache, view) = LeaseCache::new(snapshot);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.version(), 1);
        assert_eq!(view.check(&key, "mysql/0", t(110)), Ok(()));
        assert_eq!(
            view.check(&key, "mysql/1", t(110)),
            Err(LeaseError::NotHeld)
        );
        assert_eq!(
            view.check(&key, "mysql/0", t(130)),
            Err(LeaseError::LeaseExpired)
        );
    }

    #[test]
    fn upsert_and_remove() {
        let (mut cache, view) = LeaseCache::new(HashMap::new());
        assert_eq!(cache.version(), 0);
        let key = LeaseKey::new("leadership", "mysql");

        cache.upsert(key.clone(), record("mysql/0"));
        assert_eq!(view.version(), 1);
        // identical record is not a change
        cache.upsert(key.clone(), record("mysql/0"));
        assert_eq!(view.version(), 1);

        let mut pinned = record("mysql/0");
        pinned.pinned_by.insert("migration-123".into());
        cache.upsert(key.clone(), pinned);
        assert_eq!(view.version(), 2);
        assert_eq!(view.check(&key, "mysql/0", t(9999)), Ok(()));

        assert!(cache.remove(&key));
        assert!(!cache.remove(&key));
        assert_eq!(view.version(), 3);
        assert_eq!(
            view.check(&key, "mysql/0", t(110)),
            Err(LeaseError::NotHeld)
        );
    }

    #[test]
    fn replace_reports_vanished() {
        let mysql = LeaseKey::new("leadership", "mysql");
        let redis = LeaseKey::new("leadership", "redis");
        let (mut cache, view) = LeaseCache::new(HashMap::from([
            (mysql.clone(), record("mysql/0")),
            (redis.clone(), record("redis/0")),
        ]));

        let vanished = cache.replace_all(HashMap::from([(
            redis.clone(),
            record("redis/1"),
        )]));
        assert_eq!(vanished, vec![mysql.clone()]);
        assert_eq!(
            view.check(&mysql, "mysql/0", t(110)),
            Err(LeaseError::NotHeld)
        );
        assert_eq!(view.check(&redis, "redis/1", t(110)), Ok(()));

        let version = view.version();
        cache.replace_all(HashMap::from([(redis.clone(), record("redis/1"))]));
        assert_eq!(view.version(), version);
    }

    #[test]
    fn namespaces_partition() {
        let (mut cache, _view) = LeaseCache::new(HashMap::new());
        cache.upsert(LeaseKey::new("leadership", "mysql"), record("mysql/0"));
        cache.upsert(LeaseKey::new("singular", "mysql"), record("machine-0"));
        let leadership = cache.namespace_snapshot("leadership");
        assert_eq!(leadership.len(), 1);
        assert_eq!(leadership["mysql"].holder, "mysql/0");
        assert!(cache.namespace_snapshot("other").is_empty());
    }
}
