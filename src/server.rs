//! Network-facing glue between a master's mailbox and the TCP transport.
//!
//! Kept separate from `master`'s dispatch loop the same way the teacher
//! keeps `RhcNode`'s pure logic apart from the `axum`/`TcpListener` glue
//! in its `lis-mds` binary: the master doesn't know whether a caller is
//! local or remote, and this module is the only place that does.

use crate::error::{Error, Result};
use crate::master::MasterCommand;
use crate::message::{ClientRequest, Reply, ServerFrame};
use crate::transport::{read_frame, write_frame};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Binds `addr` and spawns the accept loop, returning the address actually
/// bound (useful when `addr`'s port is `0` and the OS picks one).
pub async fn publish(mailbox: mpsc::Sender<MasterCommand>, addr: SocketAddr) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Connect { addr, source })?;
    let bound = listener.local_addr().map_err(Error::Io)?;
    tokio::spawn(accept_loop(listener, mailbox));
    Ok(bound)
}

async fn accept_loop(listener: TcpListener, mailbox: mpsc::Sender<MasterCommand>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted subscriber connection");
                let mailbox = mailbox.clone();
                tokio::spawn(handle_connection(stream, mailbox));
            }
            Err(e) => {
                warn!(error = %e, "accept loop ending");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, mailbox: mpsc::Sender<MasterCommand>) {
    let (mut reader, writer) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = frame_rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    // A resyncing cloner re-requests a snapshot on this same connection
    // (see `cloner::request_resync`); dropping the previous forwarder
    // before starting the new one keeps exactly one subscription feeding
    // this socket, otherwise every later mutation would fan out twice.
    let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;

    loop {
        let req = match read_frame::<ClientRequest>(&mut reader).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "connection read failed, closing");
                break;
            }
        };

        match req {
            ClientRequest::Snapshot => {
                let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
                let (reply_tx, reply_rx) = oneshot::channel();
                if mailbox
                    .send(MasterCommand::Subscribe { updates: updates_tx, reply: reply_tx })
                    .await
                    .is_err()
                {
                    break;
                }
                let snapshot = match reply_rx.await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                if frame_tx.send(ServerFrame::Reply(Reply::SnapshotPayload(snapshot))).is_err() {
                    break;
                }
                if let Some(previous) = forwarder.take() {
                    previous.abort();
                }
                let forward_tx = frame_tx.clone();
                forwarder = Some(tokio::spawn(async move {
                    while let Some(update) = updates_rx.recv().await {
                        if forward_tx.send(ServerFrame::Update(update)).is_err() {
                            break;
                        }
                    }
                }));
            }
            ClientRequest::Quit => {
                let _ = mailbox.send(MasterCommand::Quit).await;
                break;
            }
            ClientRequest::Insert { .. }
            | ClientRequest::Increment { .. }
            | ClientRequest::Decrement { .. }
            | ClientRequest::Remove { .. }
            | ClientRequest::Clear => {
                if mailbox.send(MasterCommand::Request { req, reply: None }).await.is_err() {
                    break;
                }
            }
            ClientRequest::Lookup { .. } | ClientRequest::HasKey { .. } | ClientRequest::Size => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if mailbox
                    .send(MasterCommand::Request { req, reply: Some(reply_tx) })
                    .await
                    .is_err()
                {
                    break;
                }
                let reply = match reply_rx.await {
                    Ok(r) => r,
                    Err(_) => break,
                };
                if frame_tx.send(ServerFrame::Reply(reply)).is_err() {
                    break;
                }
            }
        }
    }

    if let Some(forwarder) = forwarder.take() {
        forwarder.abort();
    }
    drop(frame_tx);
    let _ = writer_task.await;
}

/// Dials `addr`, returning the split read/write halves on success.
pub async fn connect(addr: SocketAddr) -> Result<(tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| Error::Connect { addr, source })?;
    Ok(stream.into_split())
}
