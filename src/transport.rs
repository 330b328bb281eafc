pub(crate) mod dispatch;
pub mod quic;
pub mod websocket;

use crate::error::TransportError;
use crate::options::ConnectOptions;
use bytes::Bytes;
use std::sync::Arc;

/// Identifies one connection attempt. Assigned by the caller, never reused
/// within a process run; shows up in tracing fields and worker thread names.
pub type AttemptId = u64;

/// A transport layer usable by a signaling client, allowing the underlying
/// connection technology (websocket, multiplexed QUIC streams) to be swapped
/// without changing callers.
///
/// A transport instance is single-use: `connect` is invoked once, the attempt
/// runs to a terminal listener callback ([`TransportListener::on_closed`] or
/// [`TransportListener::on_failure`], never both), and a fresh instance with a
/// new [`AttemptId`] is created for any retry.
pub trait SignalTransport: Send + Sync + 'static {
    fn attempt_id(&self) -> AttemptId;

    /// Begins establishing the underlying connection. Never blocks; all
    /// outcomes are reported asynchronously through `listener`. Calling this
    /// more than once per instance is unsupported.
    fn connect(
        &self,
        url: &str,
        token: &str,
        options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    );

    /// Hands a payload to the underlying transport for transmission.
    ///
    /// Returns `true` only if the payload was accepted; `false` when no live
    /// channel exists. Acceptance does not guarantee delivery.
    fn send(&self, data: Bytes) -> bool;

    /// Requests a graceful shutdown, forwarding `code` and `reason` to the
    /// remote peer where the underlying technology supports it. Completion is
    /// signaled via [`TransportListener::on_closed`].
    fn close(&self, code: u16, reason: &str);

    /// Immediately releases resources held by this transport, discarding any
    /// enqueued payloads (including a pending send-on-open payload). Safe to
    /// call repeatedly; no terminal callback is guaranteed afterwards.
    fn cancel(&self);
}

/// Receives transport-level events for a single connection attempt.
///
/// For a given transport instance, callbacks are delivered as one strictly
/// ordered, non-overlapping sequence, regardless of which native threads the
/// underlying technology reports events from.
pub trait TransportListener: Send + Sync + 'static {
    fn on_open(&self, attempt_id: AttemptId);

    fn on_message(&self, attempt_id: AttemptId, data: Bytes);

    /// Advisory pre-close notice; only technologies with a close handshake
    /// (the framed-socket implementation) emit it.
    fn on_closing(&self, attempt_id: AttemptId, code: u16, reason: &str) {
        let _ = (attempt_id, code, reason);
    }

    fn on_closed(&self, attempt_id: AttemptId, code: u16, reason: &str);

    fn on_failure(
        &self,
        attempt_id: AttemptId,
        error: TransportError,
        diagnostic_context: Option<String>,
    );
}

/// Constructor surface implemented by the transport selection policy.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        options: &ConnectOptions,
        attempt_id: AttemptId,
        send_on_open: Option<Bytes>,
    ) -> Arc<dyn SignalTransport>;
}
