//! The persistent-connection supervisor (spec §4.2): keeps exactly one live
//! `Channel` available, reconnecting with exponential backoff whenever the
//! generator fails or the connection is lost, until told to shut down.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tracing::{info, instrument, warn};

use crate::backoff::Backoff;
use crate::channel::Channel;

/// Error type returned by a failed connection attempt. The supervisor
/// never inspects it beyond logging — generator failures are recovered
/// locally (spec §7) and never surfaced to request callers.
pub type GenError = Box<dyn std::error::Error + Send + Sync + 'static>;

type GenFuture<In, Out> =
    Pin<Box<dyn Future<Output = Result<Box<dyn Channel<In, Out>>, GenError>> + Send>>;

/// A user-supplied connection generator: `() -> future<Channel>`, may fail.
pub type Generator<In, Out> = Arc<dyn Fn() -> GenFuture<In, Out> + Send + Sync>;

/// Runs after each successful connect, before any request sees it.
pub type OnConnect<In, Out> = Arc<dyn Fn(Arc<dyn Channel<In, Out>>) + Send + Sync>;

/// Supervisor configuration (spec §6): a human-readable log tag and an
/// optional post-connect hook. Mirrors the teacher's plain `server::Config`
/// struct (`pending_response_buffer`) rather than a config-file/env layer —
/// spec §6 is explicit there is neither.
pub struct Config<In, Out> {
    pub description: String,
    pub on_connect: Option<OnConnect<In, Out>>,
}

impl<In, Out> Default for Config<In, Out> {
    fn default() -> Self {
        Config {
            description: "unknown".to_string(),
            on_connect: None,
        }
    }
}

impl<In, Out> Config<In, Out> {
    pub fn new(description: impl Into<String>) -> Self {
        Config {
            description: description.into(),
            on_connect: None,
        }
    }

    pub fn with_on_connect(mut self, hook: OnConnect<In, Out>) -> Self {
        self.on_connect = Some(hook);
        self
    }
}

/// The "constant channel" the owner fires to request permanent shutdown
/// (spec §3): idempotent, and observable by any number of current and
/// future waiters. Parallels the teacher's `Shutdown` (`src/shutdown.rs`),
/// generalized from a single broadcast receiver per task to a shared,
/// poll-from-anywhere flag plus notify.
struct Halt {
    alive: AtomicBool,
    notify: Notify,
}

impl Halt {
    fn new() -> Self {
        Halt {
            alive: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Idempotent: firing twice has the same effect as firing once.
    fn request_shutdown(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Same lost-wakeup hazard as `Responder::wait_terminal` (see
    /// `handle.rs`): `enable()` registers this waiter before the
    /// race-closing re-check, so a `request_shutdown()` landing between the
    /// first check and registration is never missed.
    async fn halted(&self) {
        if !self.is_alive() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_alive() {
            return;
        }
        notified.await;
    }
}

/// What `get()` resolves to: the live connection, or the permanent
/// closed-connection sentinel once the supervisor has shut down.
pub enum Acquired<In, Out> {
    Connected(Arc<dyn Channel<In, Out>>),
    Closed,
}

#[derive(Clone)]
enum ConnState<In, Out> {
    Pending,
    Connected(Arc<dyn Channel<In, Out>>),
    Closed,
}

enum WaitOutcome {
    Lost,
    Halted,
}

/// Maintains exactly one live `Channel`, reconnecting on loss.
pub struct Supervisor<In, Out> {
    description: String,
    generate: Generator<In, Out>,
    on_connect: Option<OnConnect<In, Out>>,
    halt: Halt,
    state_tx: watch::Sender<ConnState<In, Out>>,
    state_rx: watch::Receiver<ConnState<In, Out>>,
}

impl<In, Out> Supervisor<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Construct the supervisor and spawn its reconnect loop.
    pub fn spawn(generate: Generator<In, Out>, config: Config<In, Out>) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnState::Pending);
        let supervisor = Arc::new(Supervisor {
            description: config.description,
            generate,
            on_connect: config.on_connect,
            halt: Halt::new(),
            state_tx,
            state_rx,
        });

        tokio::spawn(Arc::clone(&supervisor).run());
        supervisor
    }

    /// The current connection handle, or the closed sentinel once shut
    /// down. Each successful connection is reported by the same handle
    /// until lost; a lost connection's waiters are replaced by a fresh
    /// pending state transparently.
    #[instrument(skip(self), fields(description = %self.description))]
    pub async fn get(&self) -> Acquired<In, Out> {
        let mut rx = self.state_rx.clone();
        loop {
            {
                let current = rx.borrow();
                match &*current {
                    ConnState::Connected(ch) => return Acquired::Connected(Arc::clone(ch)),
                    ConnState::Closed => return Acquired::Closed,
                    ConnState::Pending => {}
                }
            }
            if rx.changed().await.is_err() {
                return Acquired::Closed;
            }
        }
    }

    /// Idempotently request permanent shutdown. The next connection handle
    /// observed via `get()` becomes the closed sentinel, and any live
    /// `Channel` is closed.
    pub fn shutdown(&self) {
        self.halt.request_shutdown();
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new();
        let mut current: Option<Arc<dyn Channel<In, Out>>> = None;

        'reconnect: loop {
            if !self.halt.is_alive() {
                break 'reconnect;
            }

            let delay = backoff.delay();
            if !delay.is_zero() {
                warn!(
                    description = %self.description,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.halt.halted() => break 'reconnect,
                }
            }

            let attempt = tokio::select! {
                res = (self.generate)() => res,
                _ = self.halt.halted() => break 'reconnect,
            };

            let ch: Arc<dyn Channel<In, Out>> = match attempt {
                Ok(ch) => Arc::from(ch),
                Err(err) => {
                    warn!(description = %self.description, error = %err, "connection attempt failed");
                    backoff.advance();
                    continue 'reconnect;
                }
            };

            backoff.reset();
            if let Some(hook) = &self.on_connect {
                hook(Arc::clone(&ch));
            }
            let _ = self.state_tx.send(ConnState::Connected(Arc::clone(&ch)));
            current = Some(Arc::clone(&ch));
            info!(description = %self.description, "connected");

            match self.await_loss_or_halt(&ch).await {
                WaitOutcome::Halted => break 'reconnect,
                WaitOutcome::Lost => {
                    warn!(description = %self.description, "connection lost");
                    let _ = self.state_tx.send(ConnState::Pending);
                    current = None;
                }
            }
        }

        if let Some(ch) = current {
            ch.close();
        }
        let _ = self.state_tx.send(ConnState::Closed);
        info!(description = %self.description, "shut down");
    }

    async fn await_loss_or_halt(&self, ch: &Arc<dyn Channel<In, Out>>) -> WaitOutcome {
        let watcher = ch.fork();
        loop {
            tokio::select! {
                biased;
                _ = self.halt.halted() => return WaitOutcome::Halted,
                msg = watcher.read() => {
                    if msg.is_none() && watcher.is_drained() {
                        return WaitOutcome::Lost;
                    }
                }
            }
        }
    }
}
