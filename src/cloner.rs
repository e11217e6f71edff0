//! The cloner replica: connects to a remote master, mirrors its
//! `Snapshot` by applying fanned-out updates in order, and answers local
//! queries without ever waiting on the network.
//!
//! State machine mirrors the three-phase reconnect of the teacher's
//! `rhc` peer-link handling (connect, catch up, steady-state) but dropped
//! down to this crate's single snapshot-then-replay resync model: a
//! cloner never asks "send me everything since sequence N", it only ever
//! asks for the current snapshot and starts replaying from there.

use crate::message::{ClientRequest, MasterUpdate, Reply, ServerFrame};
use crate::server;
use crate::store::{Key, Snapshot};
use crate::transport::{read_frame, write_frame};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A caller's opt-in wait for a specific forwarded write to surface
/// locally (see `ClonerHandle::insert_and_forward_sync`). Fulfilled by
/// the first applied update touching `key` after registration — a
/// heuristic, not a true correlation id, since the wire protocol carries
/// none; adequate for a single caller awaiting its own just-issued write.
struct PendingAck {
    key: Key,
    ack: oneshot::Sender<()>,
}

/// Mirrors §4.3's three states directly: a caller can observe this
/// without it ever blocking on network activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Synchronizing,
    Synchronized,
}

/// The local command surface for a running cloner.
pub enum ClonerCommand {
    /// A query (`lookup`, `haskey`, `size`) always answered from the
    /// cloner's own local copy, regardless of connection state.
    Query { req: ClientRequest, reply: oneshot::Sender<Reply> },
    /// A mutation forwarded to the master best-effort; dropped silently
    /// if currently disconnected (see SPEC_FULL.md §4.3's write-forwarding
    /// semantics: the cloner never applies its own forwarded write, it
    /// waits for the replicated update like every other subscriber).
    Forward(ClientRequest),
    /// Registers a one-shot wait for the next applied update touching
    /// `key`; see `ClonerHandle::insert_and_forward_sync`.
    ForwardAndWaitForKey { key: Key, ack: oneshot::Sender<()> },
    GetConnectionState(oneshot::Sender<ConnectionState>),
    Quit,
}

enum ConnEvent {
    Connected(OwnedReadHalf, OwnedWriteHalf),
    Frame(ServerFrame),
    Disconnected,
}

struct Cloner {
    addr: SocketAddr,
    reconnect_backoff: Duration,
    snapshot: Snapshot,
    state: ConnectionState,
    write_tx: Option<mpsc::UnboundedSender<ClientRequest>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    event_tx: Option<mpsc::UnboundedSender<ConnEvent>>,
    /// Guards against spawning a second connector while one is already
    /// attempting to (re)connect — both the reader and writer tasks on a
    /// broken socket can each report `Disconnected` independently.
    reconnecting: bool,
    pending_acks: Vec<PendingAck>,
}

/// Spawns a cloner that connects to `addr` and keeps itself synchronized
/// for as long as the returned sender (or any clone of it) is alive.
pub fn spawn(addr: SocketAddr, reconnect_backoff: Duration) -> (mpsc::Sender<ClonerCommand>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let cloner = Cloner {
        addr,
        reconnect_backoff,
        snapshot: Snapshot::empty(),
        state: ConnectionState::Disconnected,
        write_tx: None,
        reader_task: None,
        writer_task: None,
        event_tx: None,
        reconnecting: true,
        pending_acks: Vec::new(),
    };
    let handle = tokio::spawn(cloner.run(cmd_rx));
    (cmd_tx, handle)
}

impl Cloner {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ClonerCommand>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ConnEvent>();
        self.event_tx = Some(event_tx.clone());
        spawn_connector(self.addr, self.reconnect_backoff, event_tx.clone());

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ClonerCommand::Quit) => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(ConnEvent::Connected(reader, writer)) => {
                            self.handle_connected(reader, writer, event_tx.clone()).await
                        }
                        Some(ConnEvent::Frame(frame)) => self.handle_frame(frame),
                        Some(ConnEvent::Disconnected) => self.handle_disconnected(),
                        None => {}
                    }
                }
            }
        }
        info!(addr = %self.addr, "cloner shutting down");
    }

    fn handle_command(&mut self, cmd: ClonerCommand) {
        match cmd {
            ClonerCommand::Query { req, reply } => {
                let msg = match req {
                    ClientRequest::Lookup { key } => Reply::Value(self.snapshot.lookup(&key)),
                    ClientRequest::HasKey { key } => Reply::Bool(self.snapshot.has_key(&key)),
                    ClientRequest::Size => Reply::Count(self.snapshot.size()),
                    _ => {
                        debug_assert!(false, "ClonerCommand::Query used with a non-query request");
                        Reply::Ack
                    }
                };
                let _ = reply.send(msg);
            }
            ClonerCommand::Forward(req) => {
                if let Some(write_tx) = &self.write_tx {
                    if write_tx.send(req).is_err() {
                        debug!("dropped forwarded write: writer task already gone");
                    }
                } else {
                    debug!("dropped forwarded write: not connected");
                }
            }
            ClonerCommand::ForwardAndWaitForKey { key, ack } => {
                self.pending_acks.push(PendingAck { key, ack });
            }
            ClonerCommand::GetConnectionState(reply) => {
                let _ = reply.send(self.state);
            }
            ClonerCommand::Quit => unreachable!("handled by caller before dispatch"),
        }
    }

    async fn handle_connected(
        &mut self,
        reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
        event_tx: mpsc::UnboundedSender<ConnEvent>,
    ) {
        info!(addr = %self.addr, "connected, requesting snapshot");
        self.state = ConnectionState::Synchronizing;
        self.reconnecting = false;

        if let Err(e) = write_frame(&mut writer, &ClientRequest::Snapshot).await {
            warn!(addr = %self.addr, error = %e, "failed to request snapshot after connecting");
            let _ = event_tx.send(ConnEvent::Disconnected);
            return;
        }

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<ClientRequest>();
        self.write_tx = Some(write_tx);

        let writer_event_tx = event_tx.clone();
        self.writer_task = Some(tokio::spawn(async move {
            let mut writer = writer;
            while let Some(req) = write_rx.recv().await {
                if write_frame(&mut writer, &req).await.is_err() {
                    let _ = writer_event_tx.send(ConnEvent::Disconnected);
                    break;
                }
            }
        }));

        self.reader_task = Some(tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match read_frame::<ServerFrame>(&mut reader).await {
                    Ok(Some(frame)) => {
                        if event_tx.send(ConnEvent::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = event_tx.send(ConnEvent::Disconnected);
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "cloner read failed");
                        let _ = event_tx.send(ConnEvent::Disconnected);
                        break;
                    }
                }
            }
        }));
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Reply(Reply::SnapshotPayload(snapshot)) => {
                info!(addr = %self.addr, sequence = %snapshot.sequence, "snapshot received, synchronized");
                self.snapshot = snapshot;
                self.state = ConnectionState::Synchronized;
            }
            ServerFrame::Reply(_) => {
                // Replies to queries this cloner issues against its own
                // master aren't modeled yet; nothing forwards those today.
            }
            ServerFrame::Update(update) => self.apply_update(update),
        }
    }

    fn apply_update(&mut self, update: MasterUpdate) {
        if self.state != ConnectionState::Synchronized {
            // Updates can arrive on the same socket before the snapshot
            // reply if the master's fan-out races the subscribe reply;
            // nothing to apply them against yet.
            return;
        }
        let expected = self.snapshot.sequence.next();
        match update.seq().cmp(&expected) {
            std::cmp::Ordering::Equal => {
                self.snapshot.apply_update(&update);
                self.fulfill_pending_acks(&update);
            }
            std::cmp::Ordering::Less => {
                debug!(
                    seq = %update.seq(),
                    expected = %expected,
                    "dropping stale update"
                );
            }
            std::cmp::Ordering::Greater => {
                warn!(
                    seq = %update.seq(),
                    expected = %expected,
                    "sequence gap detected, resyncing"
                );
                self.request_resync();
            }
        }
    }

    /// Fulfills (and removes) every pending ack whose key matches
    /// `update`'s. `Clear` touches no specific key so it never resolves
    /// one, matching the heuristic nature of this opt-in convenience.
    fn fulfill_pending_acks(&mut self, update: &MasterUpdate) {
        let Some(key) = update.key() else { return };
        let (matched, rest): (Vec<_>, Vec<_>) =
            self.pending_acks.drain(..).partition(|pending| &pending.key == key);
        self.pending_acks = rest;
        for pending in matched {
            let _ = pending.ack.send(());
        }
    }

    /// Recovers from a detected sequence gap by re-requesting a snapshot
    /// over the *existing* connection. A gap is not a connectivity
    /// failure: the socket is still good, only our local copy has
    /// drifted, so tearing it down and redialing would be the wrong
    /// recovery (see SPEC_FULL.md §4.3 / §9 — "not a reconnect").
    fn request_resync(&mut self) {
        self.state = ConnectionState::Synchronizing;
        match &self.write_tx {
            Some(write_tx) if write_tx.send(ClientRequest::Snapshot).is_ok() => {}
            _ => {
                warn!(addr = %self.addr, "resync requested but writer is gone, reconnecting instead");
                self.force_reconnect();
            }
        }
    }

    fn handle_disconnected(&mut self) {
        warn!(addr = %self.addr, "disconnected, reconnecting");
        self.force_reconnect();
    }

    /// Tears down whatever reader/writer tasks are running on the current
    /// socket (if any) and starts a fresh connect-backoff loop. A gap in
    /// the update sequence and a genuine socket error both end up here:
    /// in both cases the only recovery this store supports is a brand new
    /// connection followed by a full snapshot, never a partial catch-up.
    fn force_reconnect(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        self.write_tx = None;
        self.state = ConnectionState::Disconnected;

        if self.reconnecting {
            return;
        }
        self.reconnecting = true;
        let event_tx = self.event_tx.clone().expect("event_tx set before run loop starts");
        spawn_connector(self.addr, self.reconnect_backoff, event_tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Sequence;

    fn test_cloner() -> Cloner {
        Cloner {
            addr: "127.0.0.1:1".parse().unwrap(),
            reconnect_backoff: Duration::from_secs(3),
            snapshot: Snapshot::empty(),
            state: ConnectionState::Synchronized,
            write_tx: None,
            reader_task: None,
            writer_task: None,
            event_tx: None,
            reconnecting: true,
            pending_acks: Vec::new(),
        }
    }

    #[test]
    fn in_order_update_applies_and_stays_synchronized() {
        let mut c = test_cloner();
        let seq = c.snapshot.sequence.next();
        c.apply_update(MasterUpdate::Insert { seq, key: Key::from("a"), val: 1 });
        assert_eq!(c.snapshot.lookup(&Key::from("a")), Some(1));
        assert_eq!(c.state, ConnectionState::Synchronized);
    }

    #[test]
    fn stale_update_is_dropped_without_changing_state() {
        let mut c = test_cloner();
        c.snapshot.insert(Key::from("seed"), 0);
        let before = c.snapshot.clone();
        c.apply_update(MasterUpdate::Insert { seq: Sequence::zero(), key: Key::from("a"), val: 1 });
        assert_eq!(c.snapshot, before);
        assert_eq!(c.state, ConnectionState::Synchronized);
    }

    #[tokio::test]
    async fn sequence_gap_resyncs_over_the_existing_connection_without_reconnecting() {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let mut c = test_cloner();
        c.write_tx = Some(write_tx);

        let gap_seq = c.snapshot.sequence.next().next();
        c.apply_update(MasterUpdate::Insert { seq: gap_seq, key: Key::from("a"), val: 1 });

        assert_eq!(c.state, ConnectionState::Synchronizing);
        assert!(c.reader_task.is_none());
        assert!(c.writer_task.is_none());
        match write_rx.recv().await.unwrap() {
            ClientRequest::Snapshot => {}
            other => panic!("expected a Snapshot re-request, got {other:?}"),
        }
    }

    #[test]
    fn fulfilling_a_pending_ack_matches_by_key_only() {
        let mut c = test_cloner();
        let (ack_tx, mut ack_rx) = oneshot::channel();
        c.pending_acks.push(PendingAck { key: Key::from("a"), ack: ack_tx });

        let seq = c.snapshot.sequence.next();
        c.apply_update(MasterUpdate::Insert { seq, key: Key::from("b"), val: 1 });
        assert!(ack_rx.try_recv().is_err(), "ack for a different key must not fire");

        let seq = c.snapshot.sequence.next();
        c.apply_update(MasterUpdate::Insert { seq, key: Key::from("a"), val: 2 });
        assert!(ack_rx.try_recv().is_ok());
    }
}

fn spawn_connector(addr: SocketAddr, backoff: Duration, event_tx: mpsc::UnboundedSender<ConnEvent>) {
    tokio::spawn(async move {
        loop {
            match server::connect(addr).await {
                Ok((reader, writer)) => {
                    let _ = event_tx.send(ConnEvent::Connected(reader, writer));
                    return;
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed, backing off");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    });
}
