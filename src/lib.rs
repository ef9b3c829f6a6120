//! A Raft-replicated, bounded key-value cache.
//!
//! [`raft::RaftHandle`] is the entry point: it owns the single actor task
//! that drives leader election, log replication, snapshotting, and command
//! application, and exposes `client_write`/`client_read`/`local_read` as the
//! only ways to touch the replicated state from outside.

pub mod config;
pub mod error;
pub mod kv;
pub mod log;
pub mod metrics;
pub mod network;
pub mod node;
pub mod raft;
pub mod snapshot;
pub mod term_store;
pub mod types;

pub use config::Config;
pub use error::{ClientReadError, ClientWriteError, RaftError, RaftResult};
pub use node::Node;
pub use raft::RaftHandle;
