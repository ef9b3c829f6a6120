//! Durable, append-only storage for the replicated log.

use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::Entry;

/// Storage backend abstraction for the log, so tests can swap in something
/// lighter than a real file if the need arises (mirrors the split between
/// `RaftLog`'s in-memory cache and its backing store).
#[async_trait]
pub trait DurableLogStore: Send + Sync + 'static {
    async fn read_all(&self) -> RaftResult<Vec<Entry>>;
    async fn append(&mut self, entries: &[Entry]) -> RaftResult<()>;
    async fn truncate_from(&mut self, index: u64) -> RaftResult<()>;
    /// Permanently drop every record at or before `upto_index` from disk,
    /// once those entries are captured in a snapshot.
    async fn truncate_prefix_through(&mut self, upto_index: u64) -> RaftResult<()>;
}

/// One record's location within the log file.
#[derive(Clone, Copy, Debug)]
struct RecordSpan {
    index: u64,
    offset: u64,
    len: u32,
}

/// An append-only log file: each record is framed as a 4-byte big-endian
/// length prefix followed by a `serde_json`-encoded [`Entry`].
///
/// A trailing record whose declared length runs past EOF, or whose bytes
/// fail to deserialize, is treated as a torn write left by a crash mid-append
/// and is dropped; the file is truncated back to the end of the last good
/// record.
pub struct FileLogStore {
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<RecordSpan>,
}

impl FileLogStore {
    pub async fn open(dir: impl AsRef<Path>) -> RaftResult<Self> {
        let path = dir.as_ref().join("log");
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| RaftError::Durability(e.into()))?;

        let index = Self::scan_and_recover(&mut file, &path).await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    /// Sequentially scan the file, building an index of `(index, offset,
    /// len)` for each well-formed record. If a torn tail is found, the file
    /// is truncated to the end of the last good record and the scan stops.
    async fn scan_and_recover(file: &mut File, path: &Path) -> RaftResult<Vec<RecordSpan>> {
        file.seek(SeekFrom::Start(0)).await.map_err(|e| RaftError::Durability(e.into()))?;

        let mut index = Vec::new();
        let mut offset: u64 = 0;
        let mut good_end: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(RaftError::Durability(e.into())),
            }
            let len = u32::from_be_bytes(len_buf);

            let mut payload = vec![0u8; len as usize];
            match file.read_exact(&mut payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(path = %path.display(), "torn tail detected, truncating");
                    break;
                }
                Err(e) => return Err(RaftError::Durability(e.into())),
            }

            match serde_json::from_slice::<Entry>(&payload) {
                Ok(entry) => {
                    index.push(RecordSpan {
                        index: entry.log_id.index,
                        offset,
                        len,
                    });
                    offset += 4 + len as u64;
                    good_end = offset;
                }
                Err(_) => {
                    tracing::warn!(path = %path.display(), "corrupt trailing record, truncating");
                    break;
                }
            }
        }

        file.set_len(good_end).await.map_err(|e| RaftError::Durability(e.into()))?;
        file.seek(SeekFrom::End(0)).await.map_err(|e| RaftError::Durability(e.into()))?;
        Ok(index)
    }
}

#[async_trait]
impl DurableLogStore for FileLogStore {
    async fn read_all(&self) -> RaftResult<Vec<Entry>> {
        let mut file = self.file.lock().await;
        let mut entries = Vec::with_capacity(self.index.len());
        for span in &self.index {
            file.seek(SeekFrom::Start(span.offset + 4)).await.map_err(|e| RaftError::Durability(e.into()))?;
            let mut buf = vec![0u8; span.len as usize];
            file.read_exact(&mut buf).await.map_err(|e| RaftError::Durability(e.into()))?;
            let entry: Entry =
                serde_json::from_slice(&buf).map_err(|e| RaftError::Corruption(format!("log record at offset {}: {e}", span.offset)))?;
            entries.push(entry);
        }
        file.seek(SeekFrom::End(0)).await.map_err(|e| RaftError::Durability(e.into()))?;
        Ok(entries)
    }

    async fn append(&mut self, entries: &[Entry]) -> RaftResult<()> {
        let mut file = self.file.lock().await;
        let mut offset = file.seek(SeekFrom::End(0)).await.map_err(|e| RaftError::Durability(e.into()))?;

        for entry in entries {
            let payload = serde_json::to_vec(entry).map_err(|e| RaftError::Corruption(e.to_string()))?;
            let len = payload.len() as u32;
            file.write_all(&len.to_be_bytes()).await.map_err(|e| RaftError::Durability(e.into()))?;
            file.write_all(&payload).await.map_err(|e| RaftError::Durability(e.into()))?;
            self.index.push(RecordSpan {
                index: entry.log_id.index,
                offset,
                len,
            });
            offset += 4 + len as u64;
        }
        file.sync_data().await.map_err(|e| RaftError::Durability(e.into()))?;
        Ok(())
    }

    async fn truncate_from(&mut self, index: u64) -> RaftResult<()> {
        let cut = self.index.iter().position(|s| s.index >= index);
        let Some(cut) = cut else { return Ok(()) };

        let new_len = self.index[cut].offset;
        self.index.truncate(cut);

        let mut file = self.file.lock().await;
        file.set_len(new_len).await.map_err(|e| RaftError::Durability(e.into()))?;
        file.seek(SeekFrom::End(0)).await.map_err(|e| RaftError::Durability(e.into()))?;
        file.sync_data().await.map_err(|e| RaftError::Durability(e.into()))?;
        Ok(())
    }

    /// The file format has no in-place delete-from-front, so compaction
    /// rewrites the surviving suffix into a temp file and renames it over
    /// the original, the same atomic-replace idiom `FileTermStore` uses for
    /// the hard-state file.
    async fn truncate_prefix_through(&mut self, upto_index: u64) -> RaftResult<()> {
        let cut = self.index.iter().position(|s| s.index > upto_index).unwrap_or(self.index.len());
        if cut == 0 {
            return Ok(());
        }

        let mut file = self.file.lock().await;
        let mut surviving = Vec::with_capacity(self.index.len() - cut);
        for span in &self.index[cut..] {
            file.seek(SeekFrom::Start(span.offset)).await.map_err(|e| RaftError::Durability(e.into()))?;
            let mut buf = vec![0u8; 4 + span.len as usize];
            file.read_exact(&mut buf).await.map_err(|e| RaftError::Durability(e.into()))?;
            surviving.push(buf);
        }

        let tmp_path = self.path.with_extension("compact.tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|e| RaftError::Durability(e.into()))?;

        let mut new_index = Vec::with_capacity(surviving.len());
        let mut offset = 0u64;
        for (buf, span) in surviving.iter().zip(&self.index[cut..]) {
            tmp.write_all(buf).await.map_err(|e| RaftError::Durability(e.into()))?;
            new_index.push(RecordSpan {
                index: span.index,
                offset,
                len: span.len,
            });
            offset += buf.len() as u64;
        }
        tmp.sync_all().await.map_err(|e| RaftError::Durability(e.into()))?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| RaftError::Durability(e.into()))?;

        let mut new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| RaftError::Durability(e.into()))?;
        new_file.seek(SeekFrom::End(0)).await.map_err(|e| RaftError::Durability(e.into()))?;
        *file = new_file;
        self.index = new_index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EntryPayload;
    use crate::types::LogId;

    fn entry(term: u64, index: u64) -> Entry {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Blank,
        }
    }

    #[tokio::test]
    async fn append_then_reopen_recovers_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).await.unwrap();
            store.append(&[entry(1, 1), entry(1, 2), entry(2, 3)]).await.unwrap();
        }
        let store = FileLogStore::open(dir.path()).await.unwrap();
        let entries = store.read_all().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].log_id, LogId::new(2, 3));
    }

    #[tokio::test]
    async fn torn_tail_is_dropped_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).await.unwrap();
            store.append(&[entry(1, 1), entry(1, 2)]).await.unwrap();
        }
        // Simulate a crash mid-write: append a length prefix with no payload.
        let path = dir.path().join("log");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        file.write_all(&999u32.to_be_bytes()).unwrap();
        file.write_all(b"short").unwrap();

        let store = FileLogStore::open(dir.path()).await.unwrap();
        let entries = store.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn truncate_from_removes_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(dir.path()).await.unwrap();
        store.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).await.unwrap();
        store.truncate_from(2).await.unwrap();
        let entries = store.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log_id.index, 1);
    }

    #[tokio::test]
    async fn truncate_prefix_through_removes_compacted_entries_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(dir.path()).await.unwrap();
        store.append(&[entry(1, 1), entry(1, 2), entry(2, 3), entry(2, 4)]).await.unwrap();

        store.truncate_prefix_through(2).await.unwrap();
        let entries = store.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log_id, LogId::new(2, 3));
        assert_eq!(entries[1].log_id, LogId::new(2, 4));
    }

    #[tokio::test]
    async fn truncate_prefix_through_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).await.unwrap();
            store.append(&[entry(1, 1), entry(1, 2), entry(2, 3)]).await.unwrap();
            store.truncate_prefix_through(2).await.unwrap();
        }
        let store = FileLogStore::open(dir.path()).await.unwrap();
        let entries = store.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log_id, LogId::new(2, 3));
    }
}
