//! `Context`: the process-wide registry mapping a `Topic` to the
//! `MasterHandle` hosting it, plus the embedder-facing `open_*`/`close`
//! surface built on top of it.
//!
//! Grounded in the teacher's shared-registry pattern for looking up a
//! locally-hosted actor by name (`parking_lot::Mutex` over a `HashMap`,
//! not `dashmap`, since lookups are brief and the teacher reaches for
//! `parking_lot` wherever a plain mutex suffices).

use crate::config::ClonerConfig;
use crate::error::Result;
use crate::handle::{ClonerHandle, MasterHandle, RemoteHandle};
use crate::topic::Topic;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Reserved for future use; current values are ignored. Threaded through
/// now so a later revision can add behavior without an API break.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextFlags;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MasterFlags;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClonerFlags;

#[derive(Clone, Default)]
pub struct Context {
    masters: Arc<Mutex<HashMap<Topic, MasterHandle>>>,
}

impl Context {
    pub fn new(_flags: ContextFlags) -> Self {
        Context::default()
    }

    /// Returns the existing master for `topic` if this context already
    /// hosts one, otherwise spawns and registers a fresh one.
    pub fn open_master(&self, topic: Topic, _flags: MasterFlags) -> MasterHandle {
        let mut masters = self.masters.lock();
        if let Some(existing) = masters.get(&topic) {
            return existing.clone();
        }
        let handle = MasterHandle::new(topic.clone());
        masters.insert(topic, handle.clone());
        handle
    }

    /// Opens an outward reference to a master hosted elsewhere. Never
    /// registered here: a remote master is not ours to track or to quit.
    pub fn open_remote(&self, addr: SocketAddr) -> RemoteHandle {
        RemoteHandle::new(addr)
    }

    /// Starts a cloner mirroring `topic` from `addr`. Never registered
    /// here, for the same reason a remote handle isn't.
    pub fn open_cloner(&self, addr: SocketAddr, config: ClonerConfig, _flags: ClonerFlags) -> ClonerHandle {
        ClonerHandle::connect(addr, config)
    }

    /// Removes `topic` from the registry and sends the hosted master
    /// `quit`. Mirrors the embedder API's `store_close` on a `Store` that
    /// wraps a master: the registry entry disappears and the task stops.
    pub async fn close_master(&self, handle: MasterHandle) -> Result<()> {
        self.masters.lock().remove(handle.topic());
        handle.close().await
    }

    /// Looks up an already-hosted topic's handle without creating one.
    pub fn lookup(&self, topic: &Topic) -> Option<MasterHandle> {
        self.masters.lock().get(topic).cloned()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.masters.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_master_is_idempotent_for_the_same_topic() {
        let ctx = Context::new(ContextFlags);
        let topic = Topic::new("t").unwrap();
        let a = ctx.open_master(topic.clone(), MasterFlags);
        let b = ctx.open_master(topic.clone(), MasterFlags);
        a.insert("k", 1).await.unwrap();
        assert_eq!(b.lookup("k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn lookup_of_an_unhosted_topic_is_none() {
        let ctx = Context::new(ContextFlags);
        let topic = Topic::new("missing").unwrap();
        assert!(ctx.lookup(&topic).is_none());
    }

    #[tokio::test]
    async fn close_master_removes_the_topic_and_stops_the_task() {
        let ctx = Context::new(ContextFlags);
        let topic = Topic::new("t").unwrap();
        let handle = ctx.open_master(topic.clone(), MasterFlags);
        ctx.close_master(handle).await.unwrap();
        assert!(ctx.lookup(&topic).is_none());
    }

    #[tokio::test]
    async fn open_cloner_and_remote_are_never_registered() {
        let ctx = Context::new(ContextFlags);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let _remote = ctx.open_remote(addr);
        let _cloner = ctx.open_cloner(addr, ClonerConfig::default(), ClonerFlags);
        assert!(ctx.topics().is_empty());
    }
}
