//! File-backed durable lease store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::lease::store::{
    table_claim, table_expire, table_pin, table_revoke, table_unpin,
    LeaseTable,
};
use crate::lease::{ClaimOutcome, LeaseKey, LeaseRecord, LeaseStore};
use crate::utils::LeaseError;

use async_trait::async_trait;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Duration;

/// On-disk image of the whole lease table.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<(LeaseKey, LeaseRecord)>,
}

/// Lease store persisted as a single MessagePack snapshot file.
///
/// Every mutation is applied to a copy of the table, written to a sibling
/// temporary file, and renamed over the snapshot; only then does the copy
/// replace the in-memory table. A failed write therefore leaves both disk and
/// memory at the previous state, and the operation reports
/// `StoreUnavailable`. The async mutex serializes operations of this process;
/// it is not meant to be shared by several processes.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    table: Mutex<LeaseTable>,
}

fn unavailable(e: impl ToString) -> LeaseError {
    LeaseError::StoreUnavailable(e.to_string())
}

impl FileStore {
    /// Opens the store at `path`, loading the existing snapshot if there is
    /// one and creating an empty one otherwise.
    pub async fn open(path: &Path) -> Result<Self, LeaseError> {
        let table = if fs::try_exists(path).await? {
            let bytes = fs::read(path).await?;
            let snapshot: Snapshot = decode_from_slice(&bytes)?;
            pf_info!(
                "loaded {} leases from '{}'",
                snapshot.entries.len(),
                path.display()
            );
            snapshot.entries.into_iter().collect()
        } else {
            let table = LeaseTable::new();
            Self::persist(path, &table).await?;
            pf_info!("created lease store file '{}'", path.display());
            table
        };

        Ok(FileStore {
            path: path.to_path_buf(),
            table: Mutex::new(table),
        })
    }

    /// Writes the table to disk through a temporary file and rename.
    async fn persist(path: &Path, table: &LeaseTable) -> Result<(), LeaseError> {
        let mut entries: Vec<(LeaseKey, LeaseRecord)> = table
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let bytes = encode_to_vec(&Snapshot { entries })?;

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        fs::write(&tmp_path, &bytes).await.map_err(unavailable)?;
        fs::rename(&tmp_path, path).await.map_err(unavailable)?;
        Ok(())
    }

    /// Applies `op` to a copy of the table and commits it if `op` succeeded
    /// and changed anything.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut LeaseTable) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        let mut table = self.table.lock().await;
        let mut staged = table.clone();
        let result = op(&mut staged)?;
        if staged != *table {
            Self::persist(&self.path, &staged).await?;
            *table = staged;
        }
        Ok(result)
    }
}

#[async_trait]
impl LeaseStore for FileStore {
    async fn claim_or_extend(
        &self,
        key: &LeaseKey,
        holder: &str,
        start: SystemTime,
        duration: Duration,
    ) -> Result<ClaimOutcome, LeaseError> {
        self.mutate(|table| {
            Ok(table_claim(table, key, holder, start, duration))
        })
        .await
    }

    async fn revoke(
        &self,
        key: &LeaseKey,
        holder: &str,
    ) -> Result<(), LeaseError> {
        self.mutate(|table| table_revoke(table, key, holder)).await
    }

    async fn pin(
        &self,
        key: &LeaseKey,
        entity: &str,
    ) -> Result<LeaseRecord, LeaseError> {
        self.mutate(|table| table_pin(table, key, entity)).await
    }

    async fn unpin(
        &self,
        key: &LeaseKey,
        entity: &str,
    ) -> Result<Option<LeaseRecord>, LeaseError> {
        self.mutate(|table| Ok(table_unpin(table, key, entity))).await
    }

    async fn expire_due(
        &self,
        now: SystemTime,
    ) -> Result<Vec<LeaseKey>, LeaseError> {
        self.mutate(|table| Ok(table_expire(table, now))).await
    }

    async fn read_all(
        &self,
    ) -> Result<HashMap<LeaseKey, LeaseRecord>, LeaseError> {
        Ok(self.table.lock().await.clone())
    }
}

#[cfg(test)]
mod filestore_tests {
    use super::*;

    async fn fresh_path(path: &str) -> Result<PathBuf, LeaseError> {
        let path = PathBuf::from(path);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(path)
    }

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn reopen_keeps_leases() -> Result<(), LeaseError> {
        let path = fresh_path("/tmp/test-leaseman-0.snap").await?;
        let key = LeaseKey::new("leadership", "mysql");
        {
            let store = FileStore::open(&path).await?;
            store
                .claim_or_extend(&key, "mysql/0", t(100), Duration::from_secs(30))
                .await?;
            store.pin(&key, "migration-123").await?;
        }

        let store = FileStore::open(&path).await?;
        let all = store.read_all().await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[&key].holder, "mysql/0");
        assert!(all[&key].pinned_by.contains("migration-123"));
        assert_eq!(
            store
                .claim_or_extend(&key, "mysql/1", t(101), Duration::from_secs(30))
                .await?,
            ClaimOutcome::Denied(all[&key].clone())
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn expiry_persisted() -> Result<(), LeaseError> {
        let path = fresh_path("/tmp/test-leaseman-1.snap").await?;
        let key = LeaseKey::new("leadership", "redis");
        {
            let store = FileStore::open(&path).await?;
            store
                .claim_or_extend(&key, "redis/0", t(100), Duration::from_secs(30))
                .await?;
            assert_eq!(store.expire_due(t(200)).await?, vec![key.clone()]);
            assert_eq!(
                store.revoke(&key, "redis/0").await,
                Err(LeaseError::NotHeld)
            );
        }

        let store = FileStore::open(&path).await?;
        assert!(store.read_all().await?.is_empty());
        Ok(())
    }
}
