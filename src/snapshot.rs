//! Durable snapshots of the KV state machine, used to compact the log.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::types::ClientId;
use crate::types::LogId;
use crate::types::Seq;

/// Metadata plus the serialized state-machine image captured by a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included: LogId,
    pub timestamp: u64,
    pub map: HashMap<String, Vec<u8>>,
    pub last_applied_seq: HashMap<ClientId, Seq>,
}

/// Snapshot files live under `<node-dir>/snapshots/`, named so that
/// lexicographic sort equals numeric sort on `last_included.index`; the
/// store keeps only the newest one once a new snapshot has been durably
/// written.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

fn file_name(last_included: LogId) -> String {
    format!("snapshot-{:020}-{}.json", last_included.index, last_included.term)
}

impl FileSnapshotStore {
    pub async fn open(node_dir: impl AsRef<Path>) -> RaftResult<Self> {
        let dir = node_dir.as_ref().join("snapshots");
        tokio::fs::create_dir_all(&dir).await.map_err(|e| RaftError::Durability(e.into()))?;
        Ok(Self { dir })
    }

    /// The most recent snapshot on disk, chosen by scanning the directory
    /// and picking the file whose name sorts last.
    pub async fn load_latest(&self) -> RaftResult<Option<Snapshot>> {
        let mut read_dir = tokio::fs::read_dir(&self.dir).await.map_err(|e| RaftError::Durability(e.into()))?;
        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| RaftError::Durability(e.into()))? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("snapshot-") && name.ends_with(".json") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        let Some(latest) = names.pop() else { return Ok(None) };

        let bytes = tokio::fs::read(self.dir.join(&latest)).await.map_err(|e| RaftError::Durability(e.into()))?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| RaftError::Corruption(format!("snapshot {latest}: {e}")))?;
        Ok(Some(snapshot))
    }

    /// Write a new snapshot, then delete every other snapshot file. Always
    /// writes the new file before deleting old ones, so a crash mid-write
    /// never leaves the node without a usable snapshot.
    pub async fn save(&self, snapshot: &Snapshot) -> RaftResult<()> {
        let path = self.dir.join(file_name(snapshot.last_included));
        let payload = serde_json::to_vec(snapshot).map_err(|e| RaftError::Corruption(e.to_string()))?;
        tokio::fs::write(&path, &payload).await.map_err(|e| RaftError::Durability(e.into()))?;
        {
            let file = tokio::fs::File::open(&path).await.map_err(|e| RaftError::Durability(e.into()))?;
            file.sync_all().await.map_err(|e| RaftError::Durability(e.into()))?;
        }

        let mut read_dir = tokio::fs::read_dir(&self.dir).await.map_err(|e| RaftError::Durability(e.into()))?;
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| RaftError::Durability(e.into()))? {
            if entry.file_name() != path.file_name().unwrap() {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(index: u64, term: u64) -> Snapshot {
        Snapshot {
            last_included: LogId::new(term, index),
            timestamp: 0,
            map: HashMap::new(),
            last_applied_seq: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn load_latest_returns_none_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).await.unwrap();
        assert!(store.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).await.unwrap();
        store.save(&snap(100, 3)).await.unwrap();
        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded.last_included, LogId::new(3, 100));
    }

    #[tokio::test]
    async fn newer_snapshot_replaces_older_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).await.unwrap();
        store.save(&snap(100, 3)).await.unwrap();
        store.save(&snap(200, 3)).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path().join("snapshots")).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);

        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded.last_included.index, 200);
    }
}
