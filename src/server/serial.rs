//! The serial server (spec §4.5): read-request, run-handler, write-response,
//! one request in flight at a time.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::channel::{Channel, Reply};
use crate::error::Error;
use crate::handle::{response_pair, Responder};
use crate::server::{Closer, Handler};

/// Run the serial server loop against `ch` until it drains. Returns a
/// [`Closer`] the caller can use to close `ch` from elsewhere.
pub fn spawn<Req, Resp>(
    ch: Arc<dyn Channel<Req, Reply<Resp>>>,
    handler: Handler<Req, Resp>,
) -> Closer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (done_tx, done_rx) = response_pair();
    let closer = Closer {
        channel: Arc::clone(&ch),
        done: done_rx,
    };
    tokio::spawn(run(ch, handler, done_tx));
    closer
}

#[instrument(skip(ch, handler, done))]
async fn run<Req, Resp>(
    ch: Arc<dyn Channel<Req, Reply<Resp>>>,
    handler: Handler<Req, Resp>,
    done: Responder<()>,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    loop {
        let request = match ch.read().await {
            Some(request) => request,
            None => {
                debug!("channel drained, server loop exiting");
                break;
            }
        };

        let (responder, fut) = response_pair();
        (handler)(responder, request).await;

        let reply = match fut.await {
            Ok(value) => Reply::Value(value),
            Err(err) => Reply::Error(err.to_string()),
        };

        if ch.enqueue(reply).await.is_err() {
            debug!("failed to write reply, channel closed");
            break;
        }
    }
    done.error(Error::ConnectionClosed);
}
