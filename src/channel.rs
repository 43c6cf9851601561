//! The `Channel` primitive (spec §6): an ordered, async, closable queue of
//! messages. This module defines the trait the rest of the crate is built
//! against, plus `Reply<T>` (the tagged wire envelope spec §9's design
//! notes recommend in place of mingling error values with success values),
//! and `MemoryChannel`, an in-process reference implementation used by this
//! crate's own tests (the teacher ships a concrete `Connection` over
//! `TcpStream` for the same reason — an abstract design needs one worked,
//! testable realization).

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

/// A response value as delivered on the wire: either the payload itself, or
/// an error the peer chose to send instead. Keeping this tagged (rather
/// than letting callers throw/err their way through payload parsing) is
/// the "Msg = Data(v) | ..." design note in spec §9, specialized to the
/// response side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Value(T),
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
}

/// An ordered, async, closable message queue (spec §6).
///
/// `In` is the type read from the channel; `Out` is the type written to it
/// — the two differ because a client's channel reads responses and writes
/// requests, while a server's channel does the reverse.
#[async_trait]
pub trait Channel<In, Out>: Send + Sync
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Enqueue a message. Never loses messages until `close()`.
    async fn enqueue(&self, msg: Out) -> Result<(), ChannelError>;

    /// Read the next message, or `None` iff the channel is drained.
    async fn read(&self) -> Option<In>;

    /// Monotonically close the channel.
    fn close(&self);

    /// True iff closed and empty.
    fn is_drained(&self) -> bool;

    /// An independent reader of the same message stream, used by the
    /// supervisor purely to detect loss without disturbing the channel's
    /// primary reader.
    fn fork(&self) -> Box<dyn Channel<In, Out>>;
}

struct Shared {
    closed: AtomicBool,
    notify: Notify,
}

impl Shared {
    fn new() -> Self {
        Shared {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// An in-process `Channel` backed by a pair of unbounded mpsc queues.
///
/// Construct a connected pair with [`pair`]; one end is the "client" side
/// (reads `In`, writes `Out`), the other the "server" side (reads `Out`,
/// writes `In`) over the same logical connection.
pub struct MemoryChannel<In, Out> {
    outbound: mpsc::UnboundedSender<Out>,
    inbound: Mutex<mpsc::UnboundedReceiver<In>>,
    shared: Arc<Shared>,
}

#[async_trait]
impl<In, Out> Channel<In, Out> for MemoryChannel<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    async fn enqueue(&self, msg: Out) -> Result<(), ChannelError> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.outbound.send(msg).map_err(|_| ChannelError::Closed)
    }

    async fn read(&self) -> Option<In> {
        let mut rx = self.inbound.lock().await;

        if self.shared.is_closed() {
            return rx.try_recv().ok();
        }

        // `enable()` registers this waiter before the race-closing re-check
        // below, so a `close()` landing in between isn't missed the way a
        // bare `notified().await` would miss it (see `handle.rs`).
        let notified = self.shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.shared.is_closed() {
            return rx.try_recv().ok();
        }

        tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = notified => rx.try_recv().ok(),
        }
    }

    fn close(&self) {
        self.shared.close();
    }

    fn is_drained(&self) -> bool {
        self.shared.is_closed()
            && self
                .inbound
                .try_lock()
                .map(|rx| rx.is_empty())
                .unwrap_or(false)
    }

    fn fork(&self) -> Box<dyn Channel<In, Out>> {
        Box::new(DrainWatcher {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        })
    }
}

/// A non-destructive observer of a [`MemoryChannel`]'s closed state.
///
/// Per spec §9's fork note ("where fork is unavailable, equivalent behavior
/// is... a dedicated 'closed' future"), this fork implementation never
/// replays the payload stream — it only ever resolves `read()` to `None`
/// once the channel closes, which is all the supervisor's loss-detection
/// loop needs.
struct DrainWatcher<In, Out> {
    shared: Arc<Shared>,
    _marker: PhantomData<(In, Out)>,
}

#[async_trait]
impl<In, Out> Channel<In, Out> for DrainWatcher<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    async fn enqueue(&self, _msg: Out) -> Result<(), ChannelError> {
        Err(ChannelError::Closed)
    }

    async fn read(&self) -> Option<In> {
        if self.shared.is_closed() {
            return None;
        }

        let notified = self.shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.shared.is_closed() {
            return None;
        }
        notified.await;
        None
    }

    fn close(&self) {
        self.shared.close();
    }

    fn is_drained(&self) -> bool {
        self.shared.is_closed()
    }

    fn fork(&self) -> Box<dyn Channel<In, Out>> {
        Box::new(DrainWatcher {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        })
    }
}

/// Build a connected in-process channel pair: `(client_end, server_end)`.
pub fn pair<Req, Resp>() -> (MemoryChannel<Reply<Resp>, Req>, MemoryChannel<Req, Reply<Resp>>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (req_tx, req_rx) = mpsc::unbounded_channel::<Req>();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel::<Reply<Resp>>();
    let shared = Arc::new(Shared::new());

    let client_end = MemoryChannel {
        outbound: req_tx,
        inbound: Mutex::new(resp_rx),
        shared: Arc::clone(&shared),
    };
    let server_end = MemoryChannel {
        outbound: resp_tx,
        inbound: Mutex::new(req_rx),
        shared,
    };
    (client_end, server_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_read_round_trips() {
        let (client, server) = pair::<String, String>();
        client.enqueue("hello".to_string()).await.unwrap();
        assert_eq!(server.read().await, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn close_drains_and_signals_both_ends() {
        let (client, server) = pair::<String, String>();
        client.enqueue("a".to_string()).await.unwrap();
        client.close();

        // Buffered message still delivered...
        assert_eq!(server.read().await, Some("a".to_string()));
        // ...then the channel reports drained from either end.
        assert_eq!(server.read().await, None);
        assert!(server.is_drained());
        assert!(client.is_drained());
    }

    #[tokio::test]
    async fn fork_observes_close_without_consuming_payload() {
        let (client, server) = pair::<String, String>();
        let watcher = client.fork();

        server
            .enqueue(Reply::Value("response".to_string()))
            .await
            .unwrap();

        server.close();
        assert_eq!(watcher.read().await, None);
        assert!(watcher.is_drained());

        // The real reader still sees the buffered payload; fork did not steal it.
        assert_eq!(client.read().await, Some(Reply::Value("response".to_string())));
    }

    #[tokio::test]
    async fn enqueue_after_close_fails() {
        let (client, _server) = pair::<String, String>();
        client.close();
        assert!(matches!(
            client.enqueue("x".to_string()).await,
            Err(ChannelError::Closed)
        ));
    }
}
