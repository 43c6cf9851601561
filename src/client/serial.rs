//! The serial client (spec §4.3): one request in flight at a time, strict
//! FIFO submit-to-deliver ordering, transparent retry across reconnects.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::channel::{Channel, Reply};
use crate::client::{ClientMsg, Submission};
use crate::error::Error;
use crate::handle::{response_pair, Responder, ResponseFuture};
use crate::supervisor::{Acquired, Supervisor};

/// Submits one request at a time over a supervised connection.
pub struct SerialClient<Req, Resp> {
    tx: tokio::sync::mpsc::UnboundedSender<ClientMsg<Req, Resp>>,
}

impl<Req, Resp> Clone for SerialClient<Req, Resp> {
    fn clone(&self) -> Self {
        SerialClient {
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Resp> SerialClient<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(supervisor: Arc<Supervisor<Reply<Resp>, Req>>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(run(supervisor, rx));
        SerialClient { tx }
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

        if self
            .tx
            .send(ClientMsg::Submit(submission))
            .is_err()
        {
            // Background loop already exited (past a prior close()):
            // reject rather than queue into a drain that will never happen.
            guard.error(Error::Deactivated);
        }

        fut
    }

    /// Enqueue the close sentinel. Once its turn comes up, the underlying
    /// supervisor is shut down and all later submissions fail immediately
    /// with `Deactivated`. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.send(ClientMsg::Close);
    }
}

async fn run<Req, Resp>(
    supervisor: Arc<Supervisor<Reply<Resp>, Req>>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ClientMsg<Req, Resp>>,
) where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    while let Some(msg) = rx.recv().await {
        match msg {
            ClientMsg::Close => {
                supervisor.shutdown();
                break;
            }
            ClientMsg::Submit(submission) => {
                process(&supervisor, submission).await;
            }
        }
    }
    // Dropping `rx` here closes the mpsc; subsequent `request()` calls on
    // the sender fail fast instead of queuing forever.
}

#[instrument(skip(supervisor, submission), fields(timeout_ms = submission.timeout_ms))]
async fn process<Req, Resp>(
    supervisor: &Arc<Supervisor<Reply<Resp>, Req>>,
    submission: Submission<Req, Resp>,
) where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    let Submission {
        request,
        responder,
        timeout_ms,
    } = submission;

    let _timer = if timeout_ms >= 0 {
        let guard = responder.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms as u64)).await;
            guard.error(Error::Timeout);
        }))
    } else {
        None
    };

    loop {
        // Step 2: timer may have already fired during backoff.
        if responder.is_terminal() {
            break;
        }

        // Step 3: await the current connection, racing the deadline. Safe
        // to abandon this wait on timeout since nothing has been written
        // to the wire yet.
        let ch = tokio::select! {
            biased;
            _ = responder.wait_terminal() => break,
            acquired = supervisor.get() => match acquired {
                Acquired::Connected(ch) => ch,
                Acquired::Closed => {
                    responder.error(Error::Deactivated);
                    break;
                }
            },
        };

        // Step 4: send. A failed enqueue means the connection died between
        // `get()` and now; loop back for a fresh one.
        if ch.enqueue(request.clone()).await.is_err() {
            continue;
        }

        // Step 5: once sent, the response is in flight on the wire. Keep
        // reading to stay in sync even if the handle is already terminal
        // (timeout) — the result is silently dropped in that case, since
        // the request itself is never withdrawn from the channel (spec §5).
        match ch.read().await {
            Some(Reply::Value(value)) => {
                responder.success(value);
                break;
            }
            Some(Reply::Error(message)) => {
                responder.error(Error::Transport(message));
                break;
            }
            None => {
                debug!("connection lost mid-request, retrying");
                // Step 7: retry-on-loss, back to step 2.
                continue;
            }
        }
    }
}
