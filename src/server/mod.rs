//! Server-side state machines: §4.5 (serial and pipelined).
//!
//! Both loops run against a caller-supplied `Channel` directly (no
//! supervisor — a server reacts to connections handed to it, it doesn't
//! dial out). A handler is given a reply slot and a request, and must
//! complete the slot exactly once; failing to do so stalls that response
//! permanently, which the server makes no attempt to detect (spec §4.5).

pub mod pipelined;
pub mod serial;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::channel::{Channel, Reply};
use crate::handle::{Responder, ResponseFuture};

/// A user handler: given a reply slot and a request, eventually completes
/// the slot. Boxed to let callers pass closures or async fns uniformly.
pub type Handler<Req, Resp> =
    Arc<dyn Fn(Responder<Resp>, Req) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Closes the Channel a running server loop was spawned against.
pub struct Closer<Req, Resp> {
    channel: Arc<dyn Channel<Req, Reply<Resp>>>,
    done: ResponseFuture<()>,
}

impl<Req, Resp> Closer<Req, Resp> {
    pub fn close(&self) {
        self.channel.close();
    }

    /// Resolves once the server loop has exited. Per spec §7, a server loop
    /// only ever exits because its Channel drained, so this always
    /// resolves to `Error::ConnectionClosed` — the one §7 error kind with
    /// no pending caller request to attach it to.
    pub fn closed(self) -> ResponseFuture<()> {
        self.done
    }
}
