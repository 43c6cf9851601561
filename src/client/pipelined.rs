//! The pipelined client (spec §4.4): many requests in flight over one
//! connection, responses delivered in transmission order, retried after a
//! connection loss.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{Channel, Reply};
use crate::client::{ClientMsg, Submission};
use crate::error::Error;
use crate::handle::{response_pair, Responder, ResponseFuture};
use crate::supervisor::{Acquired, Supervisor};

const ENQUEUE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A request that has been transmitted and is awaiting its reply, tagged
/// with the channel it was sent on (spec §3: "the head of `responses`
/// always corresponds to the earliest un-replied transmitted request on
/// the channel it names").
struct InFlight<Req, Resp> {
    request: Req,
    responder: Responder<Resp>,
    channel: Arc<dyn Channel<Reply<Resp>, Req>>,
}

/// Submits many requests concurrently over a supervised connection,
/// preserving response order along any single connection.
pub struct PipelinedClient<Req, Resp> {
    tx: mpsc::UnboundedSender<ClientMsg<Req, Resp>>,
}

impl<Req, Resp> Clone for PipelinedClient<Req, Resp> {
    fn clone(&self) -> Self {
        PipelinedClient {
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Resp> PipelinedClient<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(supervisor: Arc<Supervisor<Reply<Resp>, Req>>) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();

        tokio::spawn(transmit_loop(
            Arc::clone(&supervisor),
            requests_rx,
            responses_tx,
        ));
        tokio::spawn(receive_loop(responses_rx, requests_tx.clone()));

        PipelinedClient { tx: requests_tx }
    }

    /// Submit a request with no deadline.
    pub fn request(&self, req: Req) -> ResponseFuture<Resp> {
        self.request_with_timeout(req, -1)
    }

    /// Submit a request with a deadline; `timeout_ms < 0` disables it.
    pub fn request_with_timeout(&self, req: Req, timeout_ms: i64) -> ResponseFuture<Resp> {
        let (responder, fut) = response_pair();
        let guard = responder.clone();
        let submission = Submission {
            request: req,
            responder,
            timeout_ms,
        };

        if self.tx.send(ClientMsg::Submit(submission)).is_err() {
            guard.error(Error::Deactivated);
        }

        fut
    }

    /// Enqueue the close sentinel. Idempotent; see [`super::serial::SerialClient::close`].
    pub fn close(&self) {
        let _ = self.tx.send(ClientMsg::Close);
    }
}

/// Drains `requests`, obtaining a connection and writing each request onto
/// the wire without waiting for its reply.
async fn transmit_loop<Req, Resp>(
    supervisor: Arc<Supervisor<Reply<Resp>, Req>>,
    mut requests_rx: mpsc::UnboundedReceiver<ClientMsg<Req, Resp>>,
    responses_tx: mpsc::UnboundedSender<InFlight<Req, Resp>>,
) where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    while let Some(msg) = requests_rx.recv().await {
        let submission = match msg {
            ClientMsg::Close => {
                supervisor.shutdown();
                break;
            }
            ClientMsg::Submit(submission) => submission,
        };

        let Submission {
            request,
            responder,
            timeout_ms,
        } = submission;

        // Only arm a *new* timer for a first attempt. Retries come back
        // through here with `timeout_ms = -1`, relying on the timer armed
        // on the original attempt (spec §9 open question).
        if timeout_ms >= 0 {
            let guard = responder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms as u64)).await;
                guard.error(Error::Timeout);
            });
        }

        'send: loop {
            if responder.is_terminal() {
                break 'send;
            }

            let ch = tokio::select! {
                biased;
                _ = responder.wait_terminal() => break 'send,
                acquired = supervisor.get() => match acquired {
                    Acquired::Connected(ch) => ch,
                    Acquired::Closed => {
                        responder.error(Error::Deactivated);
                        break 'send;
                    }
                },
            };

            match ch.enqueue(request.clone()).await {
                Ok(()) => {
                    let _ = responses_tx.send(InFlight {
                        request,
                        responder,
                        channel: ch,
                    });
                    break 'send;
                }
                Err(_) => {
                    if responder.is_terminal() {
                        break 'send;
                    }
                    debug!("enqueue failed, retrying after a short delay");
                    tokio::time::sleep(ENQUEUE_RETRY_DELAY).await;
                    continue 'send;
                }
            }
        }
    }
}

/// Drains `responses` in transmission order, reading from the specific
/// channel each request was sent on and re-submitting on loss.
async fn receive_loop<Req, Resp>(
    mut responses_rx: mpsc::UnboundedReceiver<InFlight<Req, Resp>>,
    requests_tx: mpsc::UnboundedSender<ClientMsg<Req, Resp>>,
) where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    while let Some(InFlight {
        request,
        responder,
        channel,
    }) = responses_rx.recv().await
    {
        match channel.read().await {
            Some(Reply::Value(value)) => {
                responder.success(value);
            }
            Some(Reply::Error(message)) => {
                responder.error(Error::Transport(message));
            }
            None => {
                debug!("connection lost, re-queueing request");
                let guard = responder.clone();
                let retry = Submission {
                    request,
                    responder,
                    timeout_ms: -1,
                };
                if requests_tx.send(ClientMsg::Submit(retry)).is_err() {
                    // The transmit loop already exited (client closed); no
                    // one will ever drain this request again.
                    guard.error(Error::Deactivated);
                }
            }
        }
    }
}
