//! Small value types shared across the crate.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A cluster member identifier. Stable across restarts.
pub type NodeId = u64;

/// A client-assigned identifier used for request deduplication.
pub type ClientId = u64;

/// A monotonically increasing per-client sequence number.
pub type Seq = u64;

/// The pairing of a log index with the term in which it was written.
///
/// `LogId::default()` is `(term: 0, index: 0)`, which represents "no entry",
/// the starting point for a pristine node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait for producing a short, loggable summary of a message, used in `tracing` fields
/// instead of the full `Debug` output.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
