//! The "result handle" of spec §3: a write-once cell with `success` and
//! `error` sub-channels, completed exactly once and then discarded.
//!
//! A plain `tokio::sync::oneshot` almost fits, but spec §4.3 step 1 races a
//! timeout timer against the normal completion path — whichever finishes
//! first wins, and the loser's completion attempt must silently no-op
//! rather than panic (oneshot's `Sender::send` otherwise has no way for two
//! independent owners to race for the one send). `Responder` wraps the
//! oneshot sender in a takeable slot so it can be cloned and raced.

use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};

use crate::error::Error;

struct Slot<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T, Error>>>>,
    terminal: Notify,
}

/// A clonable handle that completes a result handle at most once.
///
/// Used both as the client-side completion side of a submitted request and
/// as the server-side "reply slot" a handler must complete exactly once.
pub struct Responder<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Responder<T> {
    fn clone(&self) -> Self {
        Responder {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Responder<T> {
    /// Complete with a success value. Returns `false` if already terminal.
    pub fn success(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete with an error. Returns `false` if already terminal.
    pub fn error(&self, err: Error) -> bool {
        self.complete(Err(err))
    }

    /// True once this handle has already been completed by some competitor
    /// (e.g. a timeout firing before the response arrived).
    pub fn is_terminal(&self) -> bool {
        self.slot.tx.lock().unwrap().is_none()
    }

    /// Resolves once this handle becomes terminal. Used to abandon a wait
    /// that hasn't touched the wire yet (spec §4.3 step 2/3) without
    /// polling.
    ///
    /// `Notify::notify_waiters` stores no permit: a waiter that hasn't yet
    /// registered when it's called misses the wakeup entirely. Building the
    /// `Notified` future and calling `enable()` registers it as a waiter
    /// immediately, before the race-closing re-check below, so a
    /// `complete()` landing in between is never lost.
    pub async fn wait_terminal(&self) {
        if self.is_terminal() {
            return;
        }
        let notified = self.slot.terminal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_terminal() {
            return;
        }
        notified.await;
    }

    fn complete(&self, outcome: Result<T, Error>) -> bool {
        let taken = self.slot.tx.lock().unwrap().take();
        match taken {
            Some(tx) => {
                // Receiver may already be gone (caller dropped the future); that's fine.
                let _ = tx.send(outcome);
                self.slot.terminal.notify_waiters();
                true
            }
            None => false,
        }
    }
}

/// The caller-facing side: a future yielding the terminal `Result`.
///
/// A dropped `Responder` (all clones gone without completing) resolves the
/// future to `Error::Deactivated`, matching the server contract note that
/// failing to complete a reply slot stalls delivery permanently — for the
/// client side we prefer a terminal error over an unresolvable future.
pub struct ResponseFuture<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> std::future::Future for ResponseFuture<T> {
    type Output = Result<T, Error>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::task::Poll;

        match std::pin::Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Deactivated)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a fresh result handle: a `Responder` and its matching future.
pub fn response_pair<T>() -> (Responder<T>, ResponseFuture<T>) {
    let (tx, rx) = oneshot::channel();
    let responder = Responder {
        slot: Arc::new(Slot {
            tx: Mutex::new(Some(tx)),
            terminal: Notify::new(),
        }),
    };
    (responder, ResponseFuture { rx })
}
