//! The synchronous/async request bridge: lets a caller that isn't itself
//! running inside the mailbox-actor world make one request and either
//! block for the answer or schedule a callback with a timeout.
//!
//! Grounded in the teacher's `rhc` embedder surface, which hands the same
//! two shapes to callers bridging from synchronous code into an actor
//! mailbox: a blocking call for callers that are happy to wait, and a
//! timeout-bounded one for callers that are not. `RequestSink` is what
//! lets both shapes sit in front of either a master's or a cloner's
//! mailbox — SPEC_FULL.md §4.4 describes the bridge as wrapping requests
//! "against a master or cloner", not a master alone.

use crate::cloner::ClonerCommand;
use crate::error::{Error, Result};
use crate::master::MasterCommand;
use crate::message::{ClientRequest, Reply};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The outcome of an `async_request` call, delivered to the supplied
/// callback exactly once.
#[derive(Debug)]
pub enum AsyncResult {
    Success(Reply),
    Timeout,
    /// The target's mailbox was gone before a reply arrived.
    Failure,
}

/// The outcome of a decoded, typed async call (`lookup_async` and
/// friends): the same three shapes as `AsyncResult`, except a successful
/// reply has already been run through its decoder. A decode mismatch
/// folds into `Failure` rather than getting its own variant, matching
/// SPEC_FULL.md §4.4: "any decode failure is surfaced as a failure
/// result (not retried)".
#[derive(Debug)]
pub enum TypedAsyncResult<T> {
    Success(T),
    Timeout,
    Failure,
}

/// A mailbox that accepts one `ClientRequest` and replies with exactly
/// one `Reply`. Implemented for both a master's and a cloner's command
/// sender so `sync_request`/`async_request` don't need to know which
/// kind of replica they're talking to.
pub trait RequestSink {
    fn send_request(
        &self,
        req: ClientRequest,
        reply: oneshot::Sender<Reply>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
}

impl RequestSink for mpsc::Sender<MasterCommand> {
    fn send_request(
        &self,
        req: ClientRequest,
        reply: oneshot::Sender<Reply>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>> {
        let mailbox = self.clone();
        Box::pin(async move {
            mailbox
                .send(MasterCommand::Request { req, reply: Some(reply) })
                .await
                .map_err(|_| Error::PeerDown)
        })
    }
}

impl RequestSink for mpsc::Sender<ClonerCommand> {
    fn send_request(
        &self,
        req: ClientRequest,
        reply: oneshot::Sender<Reply>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>> {
        let mailbox = self.clone();
        Box::pin(async move {
            mailbox
                .send(ClonerCommand::Query { req, reply })
                .await
                .map_err(|_| Error::PeerDown)
        })
    }
}

/// Sends `req` and blocks until the target replies. Queries (`lookup`,
/// `haskey`, `size`, `snapshot` handled separately) and mutations both
/// get a reply here — unlike the wire protocol's fire-and-forget
/// mutations, a caller going through the bridge always wants the ack.
pub async fn sync_request<S: RequestSink>(sink: &S, req: ClientRequest) -> Result<Reply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    sink.send_request(req, reply_tx).await?;
    reply_rx.await.map_err(|_| Error::PeerDown)
}

/// Sends `req` and invokes `on_result` at most once, either when the
/// target replies or when `timeout` elapses first, whichever comes
/// first. Spawns its own task so the caller doesn't have to drive a
/// future to get the callback fired.
pub fn async_request<S, F>(sink: S, req: ClientRequest, timeout: Duration, on_result: F)
where
    S: RequestSink + Send + 'static,
    F: FnOnce(AsyncResult) + Send + 'static,
{
    tokio::spawn(async move {
        let (reply_tx, reply_rx) = oneshot::channel();
        if sink.send_request(req, reply_tx).await.is_err() {
            on_result(AsyncResult::Failure);
            return;
        }

        let result = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => AsyncResult::Success(reply),
            Ok(Err(_)) => AsyncResult::Failure,
            Err(_) => AsyncResult::Timeout,
        };
        on_result(result);
    });
}

/// `async_request`, but the raw `Reply` is run through `decode` before
/// reaching the caller, the same way the synchronous `lookup`/`has_key`/
/// `size` methods already decode-or-fail. A decode mismatch surfaces as
/// `Failure` rather than `Success` with something the caller has to
/// re-check.
pub fn async_request_decoded<S, D, T, F>(sink: S, req: ClientRequest, timeout: Duration, decode: D, on_result: F)
where
    S: RequestSink + Send + 'static,
    D: FnOnce(Reply) -> Result<T> + Send + 'static,
    T: Send + 'static,
    F: FnOnce(TypedAsyncResult<T>) + Send + 'static,
{
    async_request(sink, req, timeout, move |result| {
        let typed = match result {
            AsyncResult::Success(reply) => match decode(reply) {
                Ok(value) => TypedAsyncResult::Success(value),
                Err(_) => TypedAsyncResult::Failure,
            },
            AsyncResult::Timeout => TypedAsyncResult::Timeout,
            AsyncResult::Failure => TypedAsyncResult::Failure,
        };
        on_result(typed);
    });
}

/// Shared response decoders (SPEC_FULL.md §4.4). Used by every surface
/// that turns a raw `Reply` into a typed value: the synchronous
/// `MasterHandle`/`ClonerHandle` methods, the typed async methods above,
/// and `RemoteHandle`'s query methods.
pub fn decode_value(reply: Reply) -> Result<Option<crate::store::Value>> {
    match reply {
        Reply::Value(v) => Ok(v),
        _ => Err(Error::DecodeMismatch),
    }
}

pub fn decode_bool(reply: Reply) -> Result<bool> {
    match reply {
        Reply::Bool(b) => Ok(b),
        _ => Err(Error::DecodeMismatch),
    }
}

pub fn decode_count(reply: Reply) -> Result<u64> {
    match reply {
        Reply::Count(c) => Ok(c),
        _ => Err(Error::DecodeMismatch),
    }
}
