//! Durable storage for `(current_term, voted_for)`, the two fields Raft must
//! persist before replying to an RPC that depends on them.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::types::NodeId;

/// The durable portion of a node's term/vote state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Writes `HardState` as JSON to a temp file and renames it over the
/// canonical file, so a crash mid-write never leaves a half-written hard
/// state on disk — the reader only ever sees the old file or the new one,
/// never a mix.
pub struct FileTermStore {
    dir: PathBuf,
    path: PathBuf,
}

impl FileTermStore {
    pub async fn open(dir: impl AsRef<Path>) -> RaftResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join("hard-state");
        Ok(Self { dir, path })
    }

    pub async fn load(&self) -> RaftResult<HardState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| RaftError::Corruption(format!("hard-state file: {e}")))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HardState::default()),
            Err(e) => Err(RaftError::Durability(e.into())),
        }
    }

    pub async fn save(&self, hs: &HardState) -> RaftResult<()> {
        let tmp_path = self.dir.join("hard-state.tmp");
        let payload = serde_json::to_vec(hs).map_err(|e| RaftError::Corruption(e.to_string()))?;

        tokio::fs::write(&tmp_path, &payload).await.map_err(|e| RaftError::Durability(e.into()))?;
        {
            let tmp = tokio::fs::File::open(&tmp_path).await.map_err(|e| RaftError::Durability(e.into()))?;
            tmp.sync_all().await.map_err(|e| RaftError::Durability(e.into()))?;
        }
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| RaftError::Durability(e.into()))?;

        let dir = tokio::fs::File::open(&self.dir).await.map_err(|e| RaftError::Durability(e.into()))?;
        dir.sync_all().await.map_err(|e| RaftError::Durability(e.into()))?;
        Ok(())
    }
}
