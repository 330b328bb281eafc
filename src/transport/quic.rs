use crate::error::TransportError;
use crate::mux::{
    CongestionControl, MuxConfig, MuxConnection, MuxConnectionHandler, MuxConnector, MuxStream,
};
use crate::options::ConnectOptions;
use crate::transport::dispatch::ListenerDispatch;
use crate::transport::{AttemptId, SignalTransport, TransportListener};
use bytes::Bytes;
use parking_lot::Mutex;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_PORT: u16 = 443;
const IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const PING_INTERVAL: Duration = Duration::from_secs(10);
const ALPN: &str = "h3";
/// The underlying library carries no status codes, so graceful closes are
/// reported to the listener with the normal-closure websocket code.
const CLOSE_CODE_NORMAL: u16 = 1000;
const DEFAULT_CLOSE_REASON: &str = "connection closed";

/// [`SignalTransport`] conformer built on a multiplexed QUIC connection.
///
/// Two handshakes precede payload flow: the connection itself, then a data
/// stream created by the remote peer. The underlying library reports events
/// from its own internal threads with no ordering guarantee, so every native
/// callback is re-dispatched through the per-instance [`ListenerDispatch`]
/// worker; the connection and stream handles are only mutated from
/// worker-serialized jobs.
pub struct QuicTransport {
    connector: Arc<dyn MuxConnector>,
    inner: Arc<QuicInner>,
}

struct QuicInner {
    attempt_id: AttemptId,
    dispatch: ListenerDispatch,
    state: Mutex<QuicState>,
}

struct QuicState {
    phase: Phase,
    connection: Option<Arc<dyn MuxConnection>>,
    stream: Option<Arc<dyn MuxStream>>,
    listener: Option<Arc<dyn TransportListener>>,
    send_on_open: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    StreamOpen,
    Closing,
    Closed,
    Failed,
    Cancelled,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed | Phase::Cancelled)
    }
}

impl QuicState {
    fn release_handles(&mut self) {
        self.connection = None;
        self.stream = None;
    }
}

impl QuicTransport {
    pub fn new(
        attempt_id: AttemptId,
        send_on_open: Option<Bytes>,
        connector: Arc<dyn MuxConnector>,
    ) -> Self {
        Self {
            connector,
            inner: Arc::new(QuicInner {
                attempt_id,
                dispatch: ListenerDispatch::new(attempt_id),
                state: Mutex::new(QuicState {
                    phase: Phase::Idle,
                    connection: None,
                    stream: None,
                    listener: None,
                    send_on_open,
                }),
            }),
        }
    }
}

impl SignalTransport for QuicTransport {
    fn attempt_id(&self) -> AttemptId {
        self.inner.attempt_id
    }

    #[tracing::instrument(level = "debug", skip_all, fields(attempt_id = self.inner.attempt_id, url = %url))]
    fn connect(
        &self,
        url: &str,
        token: &str,
        options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) {
        {
            let mut state = self.inner.state.lock();
            state.listener = Some(listener);
            state.phase = Phase::Connecting;
        }

        let target = match Url::parse(url) {
            Ok(target) => target,
            Err(err) => {
                self.inner.fail(TransportError::InvalidUrl(err.to_string()));
                return;
            }
        };
        let Some(hostname) = target.host_str() else {
            self.inner
                .fail(TransportError::InvalidUrl(format!("missing host in {url}")));
            return;
        };

        let config = MuxConfig {
            hostname: hostname.to_string(),
            port: target.port().unwrap_or(DEFAULT_PORT),
            idle_timeout: IDLE_TIMEOUT,
            max_connections: 1,
            congestion_control: CongestionControl::Bbr2,
            ping_on: true,
            ping_interval: PING_INTERVAL,
            alpn: ALPN.to_string(),
        };

        let handler = Arc::new(QuicHandler {
            inner: self.inner.clone(),
        });
        let connection = match self.connector.create_connection(config, handler) {
            Ok(connection) => connection,
            Err(err) => {
                self.inner.fail(TransportError::Transport(Box::new(err)));
                return;
            }
        };
        self.inner.state.lock().connection = Some(connection.clone());

        let auth = auth_payload(token, options.user_agent.as_deref());
        let connect_url = rewrite_connect_url(url);
        tracing::debug!(
            attempt_id = self.inner.attempt_id,
            connect_url,
            "connecting multiplexed transport"
        );
        let code = connection.connect(&connect_url, &auth);
        if code != 0 {
            self.inner.fail(TransportError::ConnectFailed {
                code,
                message: "connection rejected by connector".to_string(),
            });
        }
    }

    fn send(&self, data: Bytes) -> bool {
        let stream = self.inner.state.lock().stream.clone();
        match stream {
            Some(stream) => stream.send_data(&data) == 0,
            None => {
                tracing::warn!(
                    attempt_id = self.inner.attempt_id,
                    "send called but no stream is available"
                );
                false
            }
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let connection = {
            let mut state = self.inner.state.lock();
            let Some(connection) = state.connection.take() else {
                return;
            };
            state.stream = None;
            state.phase = Phase::Closing;
            connection
        };
        tracing::debug!(
            attempt_id = self.inner.attempt_id,
            code,
            reason,
            "closing multiplexed connection"
        );
        // the library draws no graceful/forced distinction; the dispatch
        // worker stays up so its terminal on_closed still reaches the listener
        connection.close();
    }

    fn cancel(&self) {
        tracing::debug!(
            attempt_id = self.inner.attempt_id,
            "cancelling multiplexed transport"
        );
        // queued-but-undelivered events are dropped, not delivered
        self.inner.dispatch.shutdown();
        let connection = {
            let mut state = self.inner.state.lock();
            if !state.phase.is_terminal() {
                state.phase = Phase::Cancelled;
            }
            state.send_on_open = None;
            state.stream = None;
            state.connection.take()
        };
        if let Some(connection) = connection {
            connection.close();
        }
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.inner.dispatch.shutdown();
    }
}

impl QuicInner {
    /// Reports a terminal failure through the dispatch worker, keeping the
    /// asynchronous listener contract even for failures detected inline.
    fn fail(self: &Arc<Self>, error: TransportError) {
        let inner = self.clone();
        self.dispatch
            .submit(move || inner.deliver_failure(error, None));
    }

    fn deliver_failure(&self, error: TransportError, diagnostic_context: Option<String>) {
        let listener = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = Phase::Failed;
            state.release_handles();
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_failure(self.attempt_id, error, diagnostic_context);
        }
        self.dispatch.shutdown();
    }
}

struct QuicHandler {
    inner: Arc<QuicInner>,
}

impl MuxConnectionHandler for QuicHandler {
    fn on_connect_result(&self, error_code: i32, message: String) {
        tracing::debug!(
            attempt_id = self.inner.attempt_id,
            error_code,
            error_message = %message,
            "mux connect result"
        );
        let inner = self.inner.clone();
        self.inner.dispatch.submit(move || {
            if error_code == 0 {
                let mut state = inner.state.lock();
                if state.phase == Phase::Connecting {
                    // on_open is deferred until the peer creates the stream;
                    // sending requires one, so signaling open now would let
                    // callers race send against stream creation
                    state.phase = Phase::Connected;
                }
            } else {
                inner.deliver_failure(
                    TransportError::ConnectFailed {
                        code: error_code,
                        message,
                    },
                    None,
                );
            }
        });
    }

    fn on_stream_created(&self, stream: Arc<dyn MuxStream>) {
        tracing::debug!(
            attempt_id = self.inner.attempt_id,
            stream_id = stream.id(),
            "mux stream created"
        );
        let inner = self.inner.clone();
        self.inner.dispatch.submit(move || {
            let listener = {
                let mut state = inner.state.lock();
                if state.phase != Phase::Connected && state.phase != Phase::StreamOpen {
                    tracing::debug!(
                        attempt_id = inner.attempt_id,
                        phase = ?state.phase,
                        "ignoring stream creation outside an established connection"
                    );
                    return;
                }
                let newly_open = state.phase == Phase::Connected;
                state.stream = Some(stream.clone());
                state.phase = Phase::StreamOpen;
                if let Some(payload) = state.send_on_open.take() {
                    // transmitted under the state lock so no caller send can
                    // reach the wire ahead of it
                    let code = stream.send_data(&payload);
                    if code != 0 {
                        tracing::warn!(
                            attempt_id = inner.attempt_id,
                            code,
                            "failed to transmit send-on-open payload"
                        );
                    }
                }
                if newly_open {
                    state.listener.clone()
                } else {
                    None
                }
            };
            if let Some(listener) = listener {
                listener.on_open(inner.attempt_id);
            }
        });
    }

    fn on_stream_closed(&self, stream: Arc<dyn MuxStream>) {
        let inner = self.inner.clone();
        self.inner.dispatch.submit(move || {
            let mut state = inner.state.lock();
            if state.stream.as_ref().map(|held| held.id()) == Some(stream.id()) {
                tracing::debug!(
                    attempt_id = inner.attempt_id,
                    stream_id = stream.id(),
                    "mux stream closed"
                );
                state.stream = None;
                if state.phase == Phase::StreamOpen {
                    state.phase = Phase::Connected;
                }
            } else {
                // stale notification for a stream we no longer hold
                tracing::debug!(
                    attempt_id = inner.attempt_id,
                    stream_id = stream.id(),
                    "ignoring close for unheld stream"
                );
            }
        });
    }

    fn on_recv_data(&self, data: Bytes) {
        let inner = self.inner.clone();
        self.inner.dispatch.submit(move || {
            let listener = {
                let state = inner.state.lock();
                if state.phase.is_terminal() {
                    None
                } else {
                    state.listener.clone()
                }
            };
            if let Some(listener) = listener {
                listener.on_message(inner.attempt_id, data);
            }
        });
    }

    fn on_recv_cmd(&self, data: Bytes) {
        // out-of-band command channel, observed but never forwarded
        let inner = self.inner.clone();
        self.inner.dispatch.submit(move || {
            tracing::debug!(
                attempt_id = inner.attempt_id,
                cmd = %String::from_utf8_lossy(&data),
                "received out-of-band command"
            );
        });
    }

    fn on_closed(&self, reason: Option<String>) {
        let inner = self.inner.clone();
        self.inner.dispatch.submit(move || {
            let listener = {
                let mut state = inner.state.lock();
                if state.phase.is_terminal() {
                    return;
                }
                state.phase = Phase::Closed;
                state.release_handles();
                state.listener.clone()
            };
            let reason = reason.unwrap_or_else(|| DEFAULT_CLOSE_REASON.to_string());
            tracing::debug!(attempt_id = inner.attempt_id, reason, "mux connection closed");
            if let Some(listener) = listener {
                listener.on_closed(inner.attempt_id, CLOSE_CODE_NORMAL, &reason);
            }
            inner.dispatch.shutdown();
        });
    }

    fn on_exception(&self, message: String) {
        tracing::warn!(
            attempt_id = self.inner.attempt_id,
            error_message = %message,
            "mux connection exception"
        );
        let inner = self.inner.clone();
        self.inner
            .dispatch
            .submit(move || inner.deliver_failure(TransportError::Connection(message), None));
    }
}

/// Builds the auth string for the connection handshake: a JSON object whose
/// field names (`Authorization`, `User-Agent`) are part of the wire contract
/// with the signaling server. Empty inputs are omitted entirely.
fn auth_payload(token: &str, user_agent: Option<&str>) -> String {
    let mut fields = serde_json::Map::new();
    if !token.is_empty() {
        fields.insert(
            "Authorization".to_string(),
            serde_json::Value::String(format!("Bearer {token}")),
        );
    }
    if let Some(user_agent) = user_agent.filter(|ua| !ua.is_empty()) {
        fields.insert(
            "User-Agent".to_string(),
            serde_json::Value::String(user_agent.to_string()),
        );
    }
    if fields.is_empty() {
        String::new()
    } else {
        serde_json::Value::Object(fields).to_string()
    }
}

/// The connector expects an https url even though callers pass the websocket
/// scheme, and the query string must arrive percent-encoded as a whole.
fn rewrite_connect_url(url: &str) -> String {
    let rewritten = match url.strip_prefix("wss") {
        Some(rest) => format!("https{rest}"),
        None => url.to_string(),
    };
    match rewritten.split_once('?') {
        Some((base, query)) => {
            format!("{base}?{}", utf8_percent_encode(query, NON_ALPHANUMERIC))
        }
        None => rewritten,
    }
}
