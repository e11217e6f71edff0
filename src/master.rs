//! The master replica: owns the authoritative `Snapshot` for one topic,
//! serializes writes through a single mailbox, and fans completed
//! mutations out to every currently-live subscriber.
//!
//! Mirrors the teacher's `RhcNode::start`/`handle_message` shape (one
//! `tokio::sync::mpsc` mailbox, one task draining it to completion) but
//! without the teacher's periodic flush/heartbeat tasks: every mutation
//! here is emitted immediately, never batched.

use crate::message::{ClientRequest, MasterUpdate, Reply};
use crate::store::Snapshot;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

/// Commands accepted by a master's mailbox. This is the *local* surface;
/// the TCP transport (see `transport`) translates wire frames into these
/// before enqueuing them, so the dispatch loop below never has to know
/// whether a caller is in-process or remote.
pub enum MasterCommand {
    /// A mutation or query. `reply` is `Some` for queries (`lookup`,
    /// `haskey`, `size`) and `None` for fire-and-forget mutations.
    Request {
        req: ClientRequest,
        reply: Option<oneshot::Sender<Reply>>,
    },
    /// Register a new subscriber and hand back the current snapshot. The
    /// master begins monitoring the subscriber's liveness as part of
    /// registration (see `spawn_reaper` below): no separate "start
    /// monitoring" call is needed.
    Subscribe {
        updates: mpsc::UnboundedSender<MasterUpdate>,
        reply: oneshot::Sender<Snapshot>,
    },
    /// Posted by a subscriber's liveness reaper once its update channel's
    /// receiver has been dropped (cleanly closed, or the owning
    /// connection/cloner task exited).
    SubscriberDown(SubscriberId),
    Quit,
}

struct Master {
    snapshot: Snapshot,
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<MasterUpdate>>,
    next_subscriber_id: SubscriberId,
    mailbox: mpsc::Sender<MasterCommand>,
}

/// Spawns a master task for a fresh, empty topic and returns the sender
/// half of its mailbox. The task runs until it receives `Quit` or every
/// sender clone is dropped.
pub fn spawn() -> (mpsc::Sender<MasterCommand>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let master = Master {
        snapshot: Snapshot::empty(),
        subscribers: HashMap::new(),
        next_subscriber_id: 0,
        mailbox: tx.clone(),
    };
    let handle = tokio::spawn(master.run(rx));
    (tx, handle)
}

impl Master {
    async fn run(mut self, mut mailbox: mpsc::Receiver<MasterCommand>) {
        while let Some(cmd) = mailbox.recv().await {
            match cmd {
                MasterCommand::Request { req, reply } => self.handle_request(req, reply),
                MasterCommand::Subscribe { updates, reply } => self.handle_subscribe(updates, reply),
                MasterCommand::SubscriberDown(id) => {
                    if self.subscribers.remove(&id).is_some() {
                        debug!(subscriber = id, "subscriber down, dropped");
                    }
                }
                MasterCommand::Quit => break,
            }
        }
        info!("master shutting down");
    }

    fn handle_request(&mut self, req: ClientRequest, reply: Option<oneshot::Sender<Reply>>) {
        match req {
            ClientRequest::Insert { key, val } => {
                self.snapshot.insert(key.clone(), val);
                self.publish(MasterUpdate::Insert {
                    seq: self.snapshot.sequence.clone(),
                    key,
                    val,
                });
                self.ack(reply);
            }
            ClientRequest::Increment { key, by } => {
                self.snapshot.increment(key.clone(), by);
                self.publish(MasterUpdate::Increment {
                    seq: self.snapshot.sequence.clone(),
                    key,
                    by,
                });
                self.ack(reply);
            }
            ClientRequest::Decrement { key, by } => {
                self.snapshot.decrement(key.clone(), by);
                self.publish(MasterUpdate::Decrement {
                    seq: self.snapshot.sequence.clone(),
                    key,
                    by,
                });
                self.ack(reply);
            }
            ClientRequest::Remove { key } => {
                self.snapshot.remove(&key);
                self.publish(MasterUpdate::Remove {
                    seq: self.snapshot.sequence.clone(),
                    key,
                });
                self.ack(reply);
            }
            ClientRequest::Clear => {
                self.snapshot.clear();
                self.publish(MasterUpdate::Clear {
                    seq: self.snapshot.sequence.clone(),
                });
                self.ack(reply);
            }
            ClientRequest::Lookup { key } => {
                self.respond(reply, Reply::Value(self.snapshot.lookup(&key)));
            }
            ClientRequest::HasKey { key } => {
                self.respond(reply, Reply::Bool(self.snapshot.has_key(&key)));
            }
            ClientRequest::Size => {
                self.respond(reply, Reply::Count(self.snapshot.size()));
            }
            // These two arrive through dedicated `MasterCommand` variants
            // instead (`Subscribe`, `Quit`); a transport handing either of
            // them in here is a bug in that transport, not a protocol
            // error a caller should see.
            ClientRequest::Snapshot | ClientRequest::Quit => {
                debug_assert!(
                    false,
                    "Snapshot/Quit must be dispatched as MasterCommand::Subscribe/Quit"
                );
                self.respond(reply, Reply::Ack);
            }
        }
    }

    fn ack(&self, reply: Option<oneshot::Sender<Reply>>) {
        if let Some(reply) = reply {
            let _ = reply.send(Reply::Ack);
        }
    }

    fn respond(&self, reply: Option<oneshot::Sender<Reply>>, msg: Reply) {
        if let Some(reply) = reply {
            let _ = reply.send(msg);
        }
    }

    fn handle_subscribe(&mut self, updates: mpsc::UnboundedSender<MasterUpdate>, reply: oneshot::Sender<Snapshot>) {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        spawn_reaper(id, updates.clone(), self.mailbox.clone());
        self.subscribers.insert(id, updates);
        let _ = reply.send(self.snapshot.clone());
    }

    /// At-most-once, best-effort fan-out: a subscriber whose channel has
    /// closed is dropped immediately rather than retried or buffered.
    fn publish(&mut self, update: MasterUpdate) {
        self.subscribers.retain(|id, sink| match sink.send(update.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(subscriber = id, "subscriber channel closed, dropping on publish");
                false
            }
        });
    }
}

/// Watches a subscriber's update channel for its receiver being dropped
/// and reports the subscriber down to the master's own mailbox. This is
/// the "begin monitoring its liveness" step from the `snapshot` op: it
/// works identically whether the receiver lives in a local cloner's task
/// or in a TCP connection's forwarding task, because both cases reduce to
/// "the receiver went away."
fn spawn_reaper(id: SubscriberId, updates: mpsc::UnboundedSender<MasterUpdate>, mailbox: mpsc::Sender<MasterCommand>) {
    tokio::spawn(async move {
        updates.closed().await;
        if mailbox.send(MasterCommand::SubscriberDown(id)).await.is_err() {
            warn!(subscriber = id, "master mailbox closed before subscriber-down could be posted");
        }
    });
}
