//! The replicated log: entry types plus an in-memory cache layered over the
//! durable store.

pub mod store;

use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftResult;
use crate::kv::Command;
use crate::types::LogId;
use crate::types::MessageSummary;

pub use store::DurableLogStore;
pub use store::FileLogStore;

/// A single entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    pub payload: EntryPayload,
}

impl Entry {
    pub fn new_purged_marker(log_id: LogId) -> Self {
        Entry {
            log_id,
            payload: EntryPayload::PurgedMarker,
        }
    }
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed immediately after a new leader is elected,
    /// so it can discover the true commit index in its own term.
    Blank,
    /// A replicated key-value command.
    Normal(Command),
    /// A reserved variant for a future membership-change mechanism. Never
    /// produced or interpreted by this implementation.
    Configuration,
    /// Marks the point before which all log entries have been compacted
    /// into a snapshot.
    PurgedMarker,
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(cmd) => format!("normal:{:?}", cmd),
            EntryPayload::Configuration => "configuration".to_string(),
            EntryPayload::PurgedMarker => "purged-marker".to_string(),
        }
    }
}

/// Used by an `AppendEntriesResponse` to let the leader jump `next_index`
/// back to the follower's actual divergence point in one round trip instead
/// of walking it back one entry at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictOpt {
    /// The most recent entry in the follower's log which does not conflict
    /// with the request that triggered this response.
    pub log_id: LogId,
}

/// The Raft log: a durable store plus an in-memory cache of entries which
/// have not yet been compacted into a snapshot.
///
/// Owned exclusively by the `RaftCore` actor task; never shared behind a
/// lock.
pub struct RaftLog<S: DurableLogStore> {
    store: S,
    cache: VecDeque<Entry>,
}

impl<S: DurableLogStore> RaftLog<S> {
    /// Open a log over `store`, populating the cache from whatever the store
    /// already has on disk.
    pub async fn open(store: S) -> RaftResult<Self> {
        let cache = store.read_all().await?.into();
        Ok(Self { store, cache })
    }

    pub fn last_log_id(&self) -> LogId {
        self.cache.back().map(|e| e.log_id).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Look up an entry's term at `index`, consulting only the in-memory
    /// cache. Returns `None` if `index` has been compacted away or does not
    /// exist yet.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.cache.iter().find(|e| e.log_id.index == index).map(|e| e.log_id.term)
    }

    pub fn entries_from(&self, start_index: u64) -> Vec<Entry> {
        self.cache.iter().filter(|e| e.log_id.index >= start_index).cloned().collect()
    }

    pub async fn append(&mut self, entries: Vec<Entry>) -> RaftResult<()> {
        self.store.append(&entries).await?;
        self.cache.extend(entries);
        Ok(())
    }

    /// Remove every entry at or after `index`, on disk and in the cache.
    /// Used when a follower's log conflicts with the leader's and must be
    /// rolled back before the leader's entries are appended.
    pub async fn truncate_from(&mut self, index: u64) -> RaftResult<()> {
        self.store.truncate_from(index).await?;
        self.cache.retain(|e| e.log_id.index < index);
        Ok(())
    }

    /// Drop every entry at or before `upto_index`, both from the in-memory
    /// cache and from the durable store, once a snapshot has captured them.
    pub async fn compact_through(&mut self, upto_index: u64) -> RaftResult<()> {
        self.store.truncate_prefix_through(upto_index).await?;
        self.cache.retain(|e| e.log_id.index > upto_index);
        Ok(())
    }

    /// Find the most recent entry which does not conflict with
    /// `(conflict_term, conflict_index)`, to answer a failed `AppendEntries`
    /// with a useful `ConflictOpt`.
    pub fn conflict_opt_for(&self, nonmatching_index: u64) -> Option<ConflictOpt> {
        let conflict_term = self.cache.iter().find(|e| e.log_id.index == nonmatching_index)?.log_id.term;
        let first_of_term = self.cache.iter().find(|e| e.log_id.term == conflict_term)?;
        Some(ConflictOpt {
            log_id: LogId::new(first_of_term.log_id.term, first_of_term.log_id.index.saturating_sub(1)),
        })
    }
}
