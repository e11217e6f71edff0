//! The logical wire messages exchanged between clients, masters and
//! cloners. Encoding is a separate concern (see `transport`); this module
//! only fixes the *shapes*.

use crate::sequence::Sequence;
use crate::store::{Key, Snapshot, Value};
use serde::{Deserialize, Serialize};

/// client -> master (or client -> cloner, which forwards these verbatim
/// to its master when they lack a sequence).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientRequest {
    Insert { key: Key, val: Value },
    Increment { key: Key, by: Value },
    Decrement { key: Key, by: Value },
    Remove { key: Key },
    Clear,
    Lookup { key: Key },
    HasKey { key: Key },
    Size,
    /// Register as a subscriber and request the current snapshot.
    Snapshot,
    Quit,
}

/// master -> subscribers: one per completed mutation, always carrying the
/// sequence the mutation produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MasterUpdate {
    Insert { seq: Sequence, key: Key, val: Value },
    Increment { seq: Sequence, key: Key, by: Value },
    Decrement { seq: Sequence, key: Key, by: Value },
    Remove { seq: Sequence, key: Key },
    Clear { seq: Sequence },
}

impl MasterUpdate {
    pub fn seq(&self) -> &Sequence {
        match self {
            MasterUpdate::Insert { seq, .. }
            | MasterUpdate::Increment { seq, .. }
            | MasterUpdate::Decrement { seq, .. }
            | MasterUpdate::Remove { seq, .. }
            | MasterUpdate::Clear { seq } => seq,
        }
    }

    /// The key this update touches, or `None` for `Clear`, which touches
    /// every key at once.
    pub fn key(&self) -> Option<&Key> {
        match self {
            MasterUpdate::Insert { key, .. }
            | MasterUpdate::Increment { key, .. }
            | MasterUpdate::Decrement { key, .. }
            | MasterUpdate::Remove { key, .. } => Some(key),
            MasterUpdate::Clear { .. } => None,
        }
    }
}

/// master -> requester: the reply to a single request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    /// Response to `lookup`: `Some(v)` if present, `None` if absent.
    Value(Option<Value>),
    /// Response to `haskey`.
    Bool(bool),
    /// Response to `size`.
    Count(u64),
    /// Response to `snapshot`.
    SnapshotPayload(Snapshot),
    /// Response to fire-and-forget ops issued through the synchronous
    /// bridge when a caller still wants confirmation the master accepted
    /// (not applied, just enqueued) the request.
    Ack,
}

/// The envelope carried over a subscriber's TCP connection, since that
/// single socket multiplexes unsolicited updates with replies to the
/// subscriber's own requests (e.g. a cloner occasionally issuing its own
/// `lookup` against its master).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ServerFrame {
    Reply(Reply),
    Update(MasterUpdate),
}
