use async_trait::async_trait;
use lib_analytics::errors::CheckpointCommitError;
use lib_analytics::Checkpointer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker currently holding the shard; `None` once revoked.
    pub owner: Option<String>,
    /// Last committed sequence number.
    pub checkpoint: Option<u64>,
}

/// Shard leases and committed positions, shared by every shard task of a worker.
#[derive(Clone)]
pub struct LeaseTable {
    worker_id: String,
    // Map of shard_id -> lease
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    // Where the table is persisted; `None` keeps it in memory only
    path: Option<PathBuf>,
}

impl LeaseTable {
    pub fn in_memory(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            leases: Arc::new(Mutex::new(HashMap::new())),
            path: None,
        }
    }

    /// Loads a persisted table, or starts empty if the file does not exist yet.
    pub async fn load(path: PathBuf, worker_id: impl Into<String>) -> anyhow::Result<Self> {
        let leases = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            worker_id: worker_id.into(),
            leases: Arc::new(Mutex::new(leases)),
            path: Some(path),
        })
    }

    /// Takes the shard over for this worker and returns the position to resume after.
    pub async fn acquire(&self, shard_id: &str) -> Option<u64> {
        let mut leases = self.leases.lock().await;
        let lease = leases.entry(shard_id.to_string()).or_default();
        if let Some(previous) = lease.owner.as_deref().filter(|o| *o != self.worker_id) {
            log::warn!("action=lease-takeover shard={} previous_owner={}", shard_id, previous);
        }
        lease.owner = Some(self.worker_id.clone());
        lease.checkpoint
    }

    pub async fn is_owner(&self, shard_id: &str) -> bool {
        let leases = self.leases.lock().await;
        leases
            .get(shard_id)
            .and_then(|l| l.owner.as_deref())
            .is_some_and(|o| o == self.worker_id)
    }

    /// Drops this worker's claim. The shard's processor notices before its
    /// next batch and shuts down without committing.
    pub async fn revoke(&self, shard_id: &str) {
        let mut leases = self.leases.lock().await;
        if let Some(lease) = leases.get_mut(shard_id) {
            lease.owner = None;
            log::warn!("action=lease-revoked shard={}", shard_id);
        }
    }

    pub async fn checkpoint_of(&self, shard_id: &str) -> Option<u64> {
        let leases = self.leases.lock().await;
        leases.get(shard_id).and_then(|l| l.checkpoint)
    }

    pub async fn commit(&self, shard_id: &str, sequence_number: u64) -> Result<(), CheckpointCommitError> {
        let mut leases = self.leases.lock().await;
        let lease = leases
            .get_mut(shard_id)
            .filter(|l| l.owner.as_deref() == Some(self.worker_id.as_str()))
            .ok_or_else(|| CheckpointCommitError::LeaseLost(shard_id.to_string()))?;
        lease.checkpoint = Some(sequence_number);

        // Persisted under the lock so concurrent shards never interleave writes
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(&*leases)
                .map_err(|e| CheckpointCommitError::Store(e.to_string()))?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, bytes)
                .await
                .map_err(|e| CheckpointCommitError::Store(format!("{}: {}", tmp.display(), e)))?;
            tokio::fs::rename(&tmp, path)
                .await
                .map_err(|e| CheckpointCommitError::Store(format!("{}: {}", path.display(), e)))?;
        }
        log::debug!("action=checkpoint-committed shard={} sequence_number={}", shard_id, sequence_number);
        Ok(())
    }
}

/// One shard's view of the lease table, handed to its processor.
pub struct ShardCheckpointer {
    table: LeaseTable,
    shard_id: String,
    delivered: Option<u64>,
}

impl ShardCheckpointer {
    pub fn new(table: LeaseTable, shard_id: impl Into<String>, delivered: Option<u64>) -> Self {
        Self {
            table,
            shard_id: shard_id.into(),
            delivered,
        }
    }

    /// Records the position of the last record handed to the processor.
    pub fn mark_delivered(&mut self, sequence_number: u64) {
        self.delivered = Some(sequence_number);
    }
}

#[async_trait]
impl Checkpointer for ShardCheckpointer {
    async fn checkpoint(&mut self) -> Result<(), CheckpointCommitError> {
        let Some(sequence_number) = self.delivered else {
            return Err(CheckpointCommitError::NothingToCommit(self.shard_id.clone()));
        };
        self.table.commit(&self.shard_id, sequence_number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoked_lease_rejects_commits() {
        let table = LeaseTable::in_memory("worker-a");
        assert_eq!(table.acquire("shard-0").await, None);
        table.commit("shard-0", 4).await.expect("owner commits");

        table.revoke("shard-0").await;
        assert!(!table.is_owner("shard-0").await);
        assert!(matches!(
            table.commit("shard-0", 9).await,
            Err(CheckpointCommitError::LeaseLost(_))
        ));
        assert_eq!(table.checkpoint_of("shard-0").await, Some(4));
    }

    #[tokio::test]
    async fn nothing_delivered_means_nothing_to_commit() {
        let table = LeaseTable::in_memory("worker-a");
        table.acquire("shard-0").await;
        let mut checkpointer = ShardCheckpointer::new(table, "shard-0", None);
        assert!(matches!(
            checkpointer.checkpoint().await,
            Err(CheckpointCommitError::NothingToCommit(_))
        ));
    }

    #[tokio::test]
    async fn committed_positions_survive_a_reload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("leases.json");

        let table = LeaseTable::load(path.clone(), "worker-a").await.expect("empty table");
        table.acquire("shard-0").await;
        let mut checkpointer = ShardCheckpointer::new(table, "shard-0", None);
        checkpointer.mark_delivered(12);
        checkpointer.checkpoint().await.expect("commit");

        let reloaded = LeaseTable::load(path, "worker-b").await.expect("reload");
        assert_eq!(reloaded.acquire("shard-0").await, Some(12));
        assert!(reloaded.is_owner("shard-0").await);
    }
}
