//! Client-side state machines: §4.3 (serial) and §4.4 (pipelined).

pub mod pipelined;
pub mod serial;

use crate::handle::Responder;

/// One submitted request, paired with its result handle and deadline.
/// Mirrors spec §3's `(request, result-handle, timeout-ms)` triple.
pub(crate) struct Submission<Req, Resp> {
    pub(crate) request: Req,
    pub(crate) responder: Responder<Resp>,
    pub(crate) timeout_ms: i64,
}

/// The internal submission queue's item type. `Close` is the sentinel
/// design note from spec §9 ("a tagged variant... keeping user payload
/// types clean") applied to the client's own queue, not the wire.
pub(crate) enum ClientMsg<Req, Resp> {
    Submit(Submission<Req, Resp>),
    Close,
}
