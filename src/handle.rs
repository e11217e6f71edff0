//! The public embedder-facing API: thin, cloneable handles wrapping the
//! mailbox senders from `master` and `cloner` so callers never touch a
//! `MasterCommand`/`ClonerCommand` directly.

use crate::bridge::{self, AsyncResult, TypedAsyncResult};
use crate::cloner::{self, ClonerCommand, ConnectionState};
use crate::config::ClonerConfig;
use crate::error::{Error, Result};
use crate::master::{self, MasterCommand};
use crate::message::{ClientRequest, Reply, ServerFrame};
use crate::server;
use crate::store::{Key, Snapshot, Value};
use crate::topic::Topic;
use crate::transport::{read_frame, write_frame};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A locally-hosted master. Cloning is cheap — every clone shares the
/// same mailbox and therefore the same underlying store.
#[derive(Clone)]
pub struct MasterHandle {
    topic: Topic,
    mailbox: mpsc::Sender<MasterCommand>,
}

impl MasterHandle {
    pub fn new(topic: Topic) -> Self {
        let (mailbox, _handle) = master::spawn();
        MasterHandle { topic, mailbox }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Binds `addr` and starts accepting subscriber connections for this
    /// topic. Existing and future cloners connect to the same listener.
    /// Returns the address actually bound, which differs from `addr` when
    /// its port is `0`.
    pub async fn publish(&self, addr: SocketAddr) -> Result<SocketAddr> {
        server::publish(self.mailbox.clone(), addr).await
    }

    pub async fn insert(&self, key: impl Into<Key>, val: Value) -> Result<()> {
        self.mutate(ClientRequest::Insert { key: key.into(), val }).await
    }

    pub async fn increment(&self, key: impl Into<Key>, by: Value) -> Result<()> {
        self.mutate(ClientRequest::Increment { key: key.into(), by }).await
    }

    pub async fn decrement(&self, key: impl Into<Key>, by: Value) -> Result<()> {
        self.mutate(ClientRequest::Decrement { key: key.into(), by }).await
    }

    pub async fn remove(&self, key: impl Into<Key>) -> Result<()> {
        self.mutate(ClientRequest::Remove { key: key.into() }).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.mutate(ClientRequest::Clear).await
    }

    pub async fn lookup(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        bridge::decode_value(bridge::sync_request(&self.mailbox, ClientRequest::Lookup { key: key.into() }).await?)
    }

    pub async fn has_key(&self, key: impl Into<Key>) -> Result<bool> {
        bridge::decode_bool(bridge::sync_request(&self.mailbox, ClientRequest::HasKey { key: key.into() }).await?)
    }

    pub async fn size(&self) -> Result<u64> {
        bridge::decode_count(bridge::sync_request(&self.mailbox, ClientRequest::Size).await?)
    }

    /// Timed-async counterpart to `lookup`: `on_result` fires exactly
    /// once, already decoded the same way the synchronous method is
    /// (SPEC_FULL.md §4.4's "Response decoders").
    pub fn lookup_async(
        &self,
        key: impl Into<Key>,
        timeout: Duration,
        on_result: impl FnOnce(TypedAsyncResult<Option<Value>>) + Send + 'static,
    ) {
        bridge::async_request_decoded(
            self.mailbox.clone(),
            ClientRequest::Lookup { key: key.into() },
            timeout,
            bridge::decode_value,
            on_result,
        );
    }

    pub fn haskey_async(
        &self,
        key: impl Into<Key>,
        timeout: Duration,
        on_result: impl FnOnce(TypedAsyncResult<bool>) + Send + 'static,
    ) {
        bridge::async_request_decoded(
            self.mailbox.clone(),
            ClientRequest::HasKey { key: key.into() },
            timeout,
            bridge::decode_bool,
            on_result,
        );
    }

    pub fn size_async(&self, timeout: Duration, on_result: impl FnOnce(TypedAsyncResult<u64>) + Send + 'static) {
        bridge::async_request_decoded(self.mailbox.clone(), ClientRequest::Size, timeout, bridge::decode_count, on_result);
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (updates_tx, _updates_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox
            .send(MasterCommand::Subscribe { updates: updates_tx, reply: reply_tx })
            .await
            .map_err(|_| Error::PeerDown)?;
        reply_rx.await.map_err(|_| Error::PeerDown)
    }

    async fn mutate(&self, req: ClientRequest) -> Result<()> {
        match bridge::sync_request(&self.mailbox, req).await? {
            Reply::Ack => Ok(()),
            _ => Err(Error::DecodeMismatch),
        }
    }

    /// Fires `req` and invokes `on_result` without blocking the caller,
    /// bounded by `timeout`.
    pub fn async_request(&self, req: ClientRequest, timeout: Duration, on_result: impl FnOnce(AsyncResult) + Send + 'static) {
        bridge::async_request(self.mailbox.clone(), req, timeout, on_result);
    }

    pub async fn quit(&self) -> Result<()> {
        self.mailbox.send(MasterCommand::Quit).await.map_err(|_| Error::PeerDown)
    }

    /// Type-state close: consumes the handle and terminates the master.
    /// Prefer `Context::close_master` when this handle came from a
    /// `Context`, since that also drops the registry entry.
    pub async fn close(self) -> Result<()> {
        self.quit().await
    }
}

/// An outward reference to a master hosted elsewhere: issues requests
/// and updates over the same wire protocol a cloner uses, without
/// maintaining a local replica. SPEC_FULL.md §1 describes this as being
/// able to "issue requests and updates" against a master, matching the
/// original's `aclone_store_lookup_sync`/`haskey_sync`/`size_sync`, which
/// operate on any store handle regardless of mode, including a remote
/// one.
#[derive(Clone)]
pub struct RemoteHandle {
    addr: SocketAddr,
}

impl RemoteHandle {
    pub fn new(addr: SocketAddr) -> Self {
        RemoteHandle { addr }
    }

    pub async fn insert(&self, key: impl Into<Key>, val: Value) -> Result<()> {
        self.send_once(ClientRequest::Insert { key: key.into(), val }).await
    }

    pub async fn increment(&self, key: impl Into<Key>, by: Value) -> Result<()> {
        self.send_once(ClientRequest::Increment { key: key.into(), by }).await
    }

    pub async fn decrement(&self, key: impl Into<Key>, by: Value) -> Result<()> {
        self.send_once(ClientRequest::Decrement { key: key.into(), by }).await
    }

    pub async fn remove(&self, key: impl Into<Key>) -> Result<()> {
        self.send_once(ClientRequest::Remove { key: key.into() }).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.send_once(ClientRequest::Clear).await
    }

    pub async fn lookup(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        bridge::decode_value(self.request(ClientRequest::Lookup { key: key.into() }).await?)
    }

    pub async fn has_key(&self, key: impl Into<Key>) -> Result<bool> {
        bridge::decode_bool(self.request(ClientRequest::HasKey { key: key.into() }).await?)
    }

    pub async fn size(&self) -> Result<u64> {
        bridge::decode_count(self.request(ClientRequest::Size).await?)
    }

    /// Opens a one-shot connection, writes a single request, and drops
    /// the socket. Mirrors the fire-and-forget semantics a cloner uses to
    /// forward its own local write calls upstream.
    async fn send_once(&self, req: ClientRequest) -> Result<()> {
        let (_reader, mut writer) = server::connect(self.addr).await?;
        write_frame(&mut writer, &req).await
    }

    /// Opens a one-shot connection, writes `req`, and reads back the
    /// single `ServerFrame::Reply` the master's connection handler sends
    /// in response (see `server::handle_connection`). Used only by the
    /// query methods above, since mutations issued through this handle
    /// never wait on a reply.
    async fn request(&self, req: ClientRequest) -> Result<Reply> {
        let (mut reader, mut writer) = server::connect(self.addr).await?;
        write_frame(&mut writer, &req).await?;
        match read_frame::<ServerFrame>(&mut reader).await? {
            Some(ServerFrame::Reply(reply)) => Ok(reply),
            Some(ServerFrame::Update(_)) => Err(Error::DecodeMismatch),
            None => Err(Error::PeerDown),
        }
    }

    /// Consumes the handle. A remote master is not ours to terminate, so
    /// this is just a drop — never `quit`.
    pub fn close(self) {}
}

/// A running cloner: replicates a remote master's topic and serves
/// queries from the local replica.
#[derive(Clone)]
pub struct ClonerHandle {
    mailbox: mpsc::Sender<ClonerCommand>,
}

impl ClonerHandle {
    pub fn connect(addr: SocketAddr, config: ClonerConfig) -> Self {
        let (mailbox, _handle) = cloner::spawn(addr, config.reconnect_backoff);
        ClonerHandle { mailbox }
    }

    pub async fn lookup(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        bridge::decode_value(self.query(ClientRequest::Lookup { key: key.into() }).await?)
    }

    pub async fn has_key(&self, key: impl Into<Key>) -> Result<bool> {
        bridge::decode_bool(self.query(ClientRequest::HasKey { key: key.into() }).await?)
    }

    pub async fn size(&self) -> Result<u64> {
        bridge::decode_count(self.query(ClientRequest::Size).await?)
    }

    /// Timed-async counterpart to `lookup`. Answered from local state
    /// like the synchronous method, but bounded by `timeout` and
    /// delivered through a callback rather than blocking the caller —
    /// mirrors `MasterHandle::lookup_async` so both replica kinds offer
    /// the same typed async surface (SPEC_FULL.md §4.4).
    pub fn lookup_async(
        &self,
        key: impl Into<Key>,
        timeout: Duration,
        on_result: impl FnOnce(TypedAsyncResult<Option<Value>>) + Send + 'static,
    ) {
        bridge::async_request_decoded(
            self.mailbox.clone(),
            ClientRequest::Lookup { key: key.into() },
            timeout,
            bridge::decode_value,
            on_result,
        );
    }

    pub fn haskey_async(
        &self,
        key: impl Into<Key>,
        timeout: Duration,
        on_result: impl FnOnce(TypedAsyncResult<bool>) + Send + 'static,
    ) {
        bridge::async_request_decoded(
            self.mailbox.clone(),
            ClientRequest::HasKey { key: key.into() },
            timeout,
            bridge::decode_bool,
            on_result,
        );
    }

    pub fn size_async(&self, timeout: Duration, on_result: impl FnOnce(TypedAsyncResult<u64>) + Send + 'static) {
        bridge::async_request_decoded(self.mailbox.clone(), ClientRequest::Size, timeout, bridge::decode_count, on_result);
    }

    /// Forwards a mutation toward the master this cloner is connected
    /// to. Best-effort: if currently disconnected the write is dropped,
    /// matching the wire protocol's fire-and-forget write semantics.
    pub async fn forward_insert(&self, key: impl Into<Key>, val: Value) -> Result<()> {
        self.forward(ClientRequest::Insert { key: key.into(), val }).await
    }

    pub async fn forward_increment(&self, key: impl Into<Key>, by: Value) -> Result<()> {
        self.forward(ClientRequest::Increment { key: key.into(), by }).await
    }

    pub async fn forward_decrement(&self, key: impl Into<Key>, by: Value) -> Result<()> {
        self.forward(ClientRequest::Decrement { key: key.into(), by }).await
    }

    pub async fn forward_remove(&self, key: impl Into<Key>) -> Result<()> {
        self.forward(ClientRequest::Remove { key: key.into() }).await
    }

    pub async fn forward_clear(&self) -> Result<()> {
        self.forward(ClientRequest::Clear).await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox
            .send(ClonerCommand::GetConnectionState(reply_tx))
            .await
            .map_err(|_| Error::PeerDown)?;
        reply_rx.await.map_err(|_| Error::PeerDown)
    }

    async fn query(&self, req: ClientRequest) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox
            .send(ClonerCommand::Query { req, reply: reply_tx })
            .await
            .map_err(|_| Error::PeerDown)?;
        reply_rx.await.map_err(|_| Error::PeerDown)
    }

    async fn forward(&self, req: ClientRequest) -> Result<()> {
        self.mailbox.send(ClonerCommand::Forward(req)).await.map_err(|_| Error::PeerDown)
    }

    pub async fn quit(&self) -> Result<()> {
        self.mailbox.send(ClonerCommand::Quit).await.map_err(|_| Error::PeerDown)
    }

    pub async fn close(self) -> Result<()> {
        self.quit().await
    }

    /// Forwards `insert(key, val)` to the master, as `forward_insert`
    /// does, but additionally waits until that key's value has come back
    /// around as an applied, sequenced update — i.e. until the caller's
    /// own write is visible in this cloner's local copy.
    ///
    /// This is the acknowledged-write convenience from Open Question 3:
    /// plain forwarding stays fire-and-forget (no invariant requires
    /// this), but a caller that wants confirmation can opt into it here
    /// instead of polling `lookup` in a loop. `timeout` bounds the wait;
    /// a forwarded write that never surfaces (e.g. the cloner disconnects
    /// before the master's fan-out reaches it) times out rather than
    /// hanging forever.
    pub async fn insert_and_forward_sync(&self, key: impl Into<Key>, val: Value, timeout: Duration) -> Result<()> {
        let key = key.into();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.mailbox
            .send(ClonerCommand::ForwardAndWaitForKey { key: key.clone(), ack: ack_tx })
            .await
            .map_err(|_| Error::PeerDown)?;
        self.mailbox
            .send(ClonerCommand::Forward(ClientRequest::Insert { key, val }))
            .await
            .map_err(|_| Error::PeerDown)?;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::PeerDown),
            Err(_) => Err(Error::Timeout),
        }
    }
}
