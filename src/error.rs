//! Error kinds surfaced to callers, per the error handling design.
//!
//! Generator failures and mid-stream connection loss are recovered locally
//! by the supervisor and never become one of these variants; they are only
//! ever logged. `Error` is only ever produced by completing a result handle
//! or a server's reply slot.

/// The error side of a result handle / reply slot.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The per-request deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The client was closed before this request completed.
    #[error("client is deactivated")]
    Deactivated,

    /// The peer responded with an error value; carried verbatim.
    #[error("transport error: {0}")]
    Transport(String),

    /// A server-side handler read from a Channel that is already drained.
    #[error("connection closed")]
    ConnectionClosed,
}
