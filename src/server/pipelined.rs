//! The pipelined server (spec §4.5): handlers may complete out of order,
//! but replies are written back in request-arrival order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::channel::{Channel, Reply};
use crate::error::Error;
use crate::handle::{response_pair, Responder, ResponseFuture};
use crate::server::{Closer, Handler};

/// Run the pipelined server loop against `ch` until it drains. Returns a
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

    let (slots_tx, slots_rx) = mpsc::unbounded_channel();
    tokio::spawn(request_loop(Arc::clone(&ch), handler, slots_tx));
    tokio::spawn(response_loop(ch, slots_rx, done_tx));

    closer
}

/// Reads requests, invokes the handler, and pushes the pending reply slot —
/// in arrival order — without waiting for the handler to finish.
#[instrument(skip(ch, handler, slots_tx))]
async fn request_loop<Req, Resp>(
    ch: Arc<dyn Channel<Req, Reply<Resp>>>,
    handler: Handler<Req, Resp>,
    slots_tx: mpsc::UnboundedSender<ResponseFuture<Resp>>,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    loop {
        let request = match ch.read().await {
            Some(request) => request,
            None => {
                debug!("channel drained, request loop exiting");
                break;
            }
        };

        let (responder, fut) = response_pair();
        tokio::spawn((handler)(responder, request));

        if slots_tx.send(fut).is_err() {
            break;
        }
    }
    // Dropping `slots_tx` here unblocks `response_loop`'s `recv()` once it
    // has drained whatever slots are still pending.
}

/// Drains the pending reply slots in arrival order, writing each reply as
/// soon as its slot completes — regardless of how long later slots take.
/// Completes `done` once the server has fully stopped, i.e. once this loop
/// (the last of the two to exit) observes the channel closed.
#[instrument(skip(ch, slots_rx, done))]
async fn response_loop<Req, Resp>(
    ch: Arc<dyn Channel<Req, Reply<Resp>>>,
    mut slots_rx: mpsc::UnboundedReceiver<ResponseFuture<Resp>>,
    done: Responder<()>,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    while let Some(fut) = slots_rx.recv().await {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pair;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn replies_in_arrival_order_despite_reverse_completion() {
        let (client, server) = pair::<u32, u32>();
        let handler: Handler<u32, u32> = Arc::new(|responder, req| {
            Box::pin(async move {
                let delay = 100u64.saturating_sub(u64::from(req));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                responder.success(req + 1);
            })
        });
        spawn(Arc::new(server), handler);

        for i in 1..=5u32 {
            client.enqueue(i).await.unwrap();
        }

        for i in 1..=5u32 {
            assert_eq!(client.read().await, Some(Reply::Value(i + 1)));
        }
    }

    #[tokio::test]
    async fn closed_surfaces_connection_closed() {
        let (client, server) = pair::<u32, u32>();
        let handler: Handler<u32, u32> = Arc::new(|responder, req| {
            Box::pin(async move {
                responder.success(req + 1);
            })
        });
        let closer = spawn(Arc::new(server), handler);

        closer.close();
        assert_eq!(closer.closed().await, Err(Error::ConnectionClosed));
        assert!(client.is_drained());
    }
}
