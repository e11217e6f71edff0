//! Replicated, sequence-ordered key-value store with master/cloner
//! fan-out replication.
//!
//! A process hosts zero or more masters (one per `Topic`), each owning
//! the authoritative copy of its store and fanning every mutation out to
//! subscribers in commit order. A cloner mirrors one master's topic over
//! TCP, replaying updates locally and always answering queries from its
//! own copy rather than the network.

pub mod bridge;
pub mod cloner;
pub mod config;
pub mod error;
pub mod handle;
pub mod master;
pub mod message;
pub mod registry;
pub mod sequence;
pub mod server;
pub mod store;
pub mod topic;
pub mod transport;

pub use config::{ClonerConfig, Config};
pub use error::{Error, Result};
pub use handle::{ClonerHandle, MasterHandle, RemoteHandle};
pub use registry::{ClonerFlags, Context, ContextFlags, MasterFlags};
pub use sequence::Sequence;
pub use store::{Key, Snapshot, Value};
pub use topic::Topic;
