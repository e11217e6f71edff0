//! The in-memory key-value snapshot shared by masters and cloners.
//!
//! Both replicas apply the same five mutations (`insert`, `increment`,
//! `decrement`, `remove`, `clear`) to an owned `Snapshot`; the master does
//! it as the authoritative write path and also emits the resulting
//! sequence, while a cloner replays the same logic without emitting
//! anything. Keeping the mutation logic here, parametrized only by
//! `&mut Snapshot`, is what makes "same semantics as the master's write
//! path, minus emission" cheap to guarantee by construction instead of by
//! convention.

use crate::message::MasterUpdate;
use crate::sequence::Sequence;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An opaque byte key. Canonicalized as an owned byte vector so it can be
/// sent across the wire and used as a map key without further encoding
/// decisions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<u8>);

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s.into_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key(v)
    }
}

/// The only value type this store supports: a signed 64-bit integer.
/// Arithmetic mutations are only meaningful for this type.
pub type Value = i64;

/// The pair (mapping key -> value, sequence) captured atomically. Two
/// snapshots are equal iff their sequence and mapping are equal, which
/// `BTreeMap`'s derived `Eq` already gives us; `BTreeMap` over `DashMap`
/// because exactly one actor owns a `Snapshot` at a time and tests want
/// deterministic iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub store: BTreeMap<Key, Value>,
    pub sequence: Sequence,
}

impl Snapshot {
    pub fn empty() -> Self {
        Snapshot {
            store: BTreeMap::new(),
            sequence: Sequence::zero(),
        }
    }

    pub fn lookup(&self, key: &Key) -> Option<Value> {
        self.store.get(key).copied()
    }

    pub fn has_key(&self, key: &Key) -> bool {
        self.store.contains_key(key)
    }

    pub fn size(&self) -> u64 {
        self.store.len() as u64
    }

    /// `map[key] = val`; advances the sequence.
    pub fn insert(&mut self, key: Key, val: Value) {
        self.sequence.bump();
        self.store.insert(key, val);
    }

    /// `map[key] = map[key] + by`, with an absent key read as zero;
    /// advances the sequence.
    pub fn increment(&mut self, key: Key, by: Value) {
        self.sequence.bump();
        let entry = self.store.entry(key).or_insert(0);
        *entry += by;
    }

    /// `map[key] = map[key] - by`, with an absent key read as zero;
    /// advances the sequence.
    pub fn decrement(&mut self, key: Key, by: Value) {
        self.sequence.bump();
        let entry = self.store.entry(key).or_insert(0);
        *entry -= by;
    }

    /// Erase `key`; no error if absent. Advances the sequence regardless.
    pub fn remove(&mut self, key: &Key) {
        self.sequence.bump();
        self.store.remove(key);
    }

    /// Erase everything; advances the sequence.
    pub fn clear(&mut self) {
        self.sequence.bump();
        self.store.clear();
    }

    /// Replays an update a master already sequenced. Unlike the mutators
    /// above, this adopts `update`'s sequence directly instead of bumping
    /// its own — a cloner's copy of the sequence must equal the master's,
    /// not merely be greater than its own previous value.
    pub fn apply_update(&mut self, update: &MasterUpdate) {
        match update {
            MasterUpdate::Insert { seq, key, val } => {
                self.store.insert(key.clone(), *val);
                self.sequence = seq.clone();
            }
            MasterUpdate::Increment { seq, key, by } => {
                let entry = self.store.entry(key.clone()).or_insert(0);
                *entry += by;
                self.sequence = seq.clone();
            }
            MasterUpdate::Decrement { seq, key, by } => {
                let entry = self.store.entry(key.clone()).or_insert(0);
                *entry -= by;
                self.sequence = seq.clone();
            }
            MasterUpdate::Remove { seq, key } => {
                self.store.remove(key);
                self.sequence = seq.clone();
            }
            MasterUpdate::Clear { seq } => {
                self.store.clear();
                self.sequence = seq.clone();
            }
        }
    }
}
