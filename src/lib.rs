//! A durable, reconnecting client/server messaging core built on an
//! abstract, closable [`Channel`](channel::Channel): automatic
//! reconnection with exponential backoff, per-request timeouts, serial and
//! pipelined request modes, and graceful shutdown.
//!
//! The transport itself (framing, codec, sockets) is out of scope; callers
//! supply a [`channel::Channel`] implementation and a connection generator.
//! [`channel::MemoryChannel`] is shipped as a working in-process
//! realization used by this crate's own tests.

pub mod backoff;
pub mod channel;
pub mod client;
pub mod error;
pub mod handle;
pub mod server;
pub mod supervisor;

pub use channel::{Channel, Reply};
pub use client::pipelined::PipelinedClient;
pub use client::serial::SerialClient;
pub use error::Error;
pub use handle::{Responder, ResponseFuture};
pub use supervisor::{Acquired, Config, Supervisor};
