use crate::error::TransportError;
use crate::options::ConnectOptions;
use crate::transport::{AttemptId, SignalTransport, TransportListener};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;

/// Reported when the stream ends without a preceding close frame.
const CLOSE_CODE_ABNORMAL: u16 = 1006;

/// [`SignalTransport`] conformer built on a single full-duplex websocket.
///
/// The underlying connection preserves message boundaries itself, so events
/// pass straight through from this transport's single reader task with no
/// extra marshaling. `connect` must be invoked from within a Tokio runtime.
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    attempt_id: AttemptId,
    send_on_open: Mutex<Option<Bytes>>,
    state: Mutex<WsState>,
}

enum WsState {
    Idle,
    Connecting {
        cancel: CancellationToken,
        /// A graceful close requested before the handshake finished; honored
        /// as soon as the connection becomes writable.
        pending_close: Option<(u16, String)>,
    },
    Open {
        writer_tx: mpsc::UnboundedSender<tungstenite::Message>,
        cancel: CancellationToken,
    },
    Terminated,
}

impl WebSocketTransport {
    pub fn new(attempt_id: AttemptId, send_on_open: Option<Bytes>) -> Self {
        Self {
            inner: Arc::new(WsInner {
                attempt_id,
                send_on_open: Mutex::new(send_on_open),
                state: Mutex::new(WsState::Idle),
            }),
        }
    }
}

impl SignalTransport for WebSocketTransport {
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
        let attempt_id = self.inner.attempt_id;
        let request = match build_request(url, token, options) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(?err, attempt_id, "failed to build websocket request");
                let inner = self.inner.clone();
                // outcome must still arrive asynchronously via the listener
                tokio::spawn(async move {
                    *inner.state.lock() = WsState::Terminated;
                    listener.on_failure(attempt_id, err, None);
                });
                return;
            }
        };

        let cancel = CancellationToken::new();
        *self.inner.state.lock() = WsState::Connecting {
            cancel: cancel.clone(),
            pending_close: None,
        };
        let send_on_open = self.inner.send_on_open.lock().take();

        let inner = self.inner.clone();
        tokio::spawn(run_connection(inner, request, listener, send_on_open, cancel));
    }

    fn send(&self, data: Bytes) -> bool {
        match &*self.inner.state.lock() {
            WsState::Open { writer_tx, .. } => {
                writer_tx.send(tungstenite::Message::Binary(data)).is_ok()
            }
            _ => {
                tracing::warn!(
                    attempt_id = self.inner.attempt_id,
                    "send called without an open websocket"
                );
                false
            }
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            WsState::Open { writer_tx, .. } => {
                tracing::debug!(
                    attempt_id = self.inner.attempt_id,
                    code,
                    reason,
                    "closing websocket"
                );
                let _ = writer_tx.send(tungstenite::Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.to_string().into(),
                })));
            }
            WsState::Connecting { pending_close, .. } => {
                tracing::debug!(
                    attempt_id = self.inner.attempt_id,
                    code,
                    reason,
                    "close requested during handshake, deferring until open"
                );
                *pending_close = Some((code, reason.to_string()));
            }
            _ => {}
        }
    }

    fn cancel(&self) {
        self.inner.send_on_open.lock().take();
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut *state, WsState::Terminated) {
            WsState::Connecting { cancel, .. } | WsState::Open { cancel, .. } => {
                tracing::debug!(
                    attempt_id = self.inner.attempt_id,
                    "cancelling websocket transport"
                );
                cancel.cancel();
            }
            _ => {}
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn build_request(
    url: &str,
    token: &str,
    options: &ConnectOptions,
) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|err| TransportError::WebSocket(Box::new(err)))?;

    let authorization = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|err| TransportError::WebSocket(Box::new(tungstenite::Error::HttpFormat(err.into()))))?;
    request.headers_mut().insert(header::AUTHORIZATION, authorization);

    if let Some(user_agent) = options.user_agent.as_deref().filter(|ua| !ua.is_empty()) {
        let user_agent = HeaderValue::from_str(user_agent).map_err(|err| {
            TransportError::WebSocket(Box::new(tungstenite::Error::HttpFormat(err.into())))
        })?;
        request.headers_mut().insert(header::USER_AGENT, user_agent);
    }

    Ok(request)
}

async fn run_connection(
    inner: Arc<WsInner>,
    request: Request,
    listener: Arc<dyn TransportListener>,
    send_on_open: Option<Bytes>,
    cancel: CancellationToken,
) {
    let attempt_id = inner.attempt_id;

    tracing::debug!(attempt_id, "connecting to signaling server");
    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(attempt_id, "connect cancelled during handshake");
            return;
        }
        result = tokio_tungstenite::connect_async(request) => result,
    };
    let (websocket_stream, response) = match connected {
        Ok(connected) => connected,
        Err(err) => {
            tracing::warn!(?err, attempt_id, "websocket handshake failed");
            *inner.state.lock() = WsState::Terminated;
            listener.on_failure(attempt_id, TransportError::WebSocket(Box::new(err)), None);
            return;
        }
    };
    tracing::debug!(?response, attempt_id, "websocket handshake response");

    let (mut websocket_tx, mut websocket_rx) = websocket_stream.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
    if let Some(payload) = send_on_open {
        // first frame on the wire, ahead of any caller-issued send
        let _ = writer_tx.send(tungstenite::Message::Binary(payload));
    }
    {
        let mut state = inner.state.lock();
        let WsState::Connecting { pending_close, .. } = &mut *state else {
            // cancelled while the handshake was completing
            return;
        };
        if let Some((code, reason)) = pending_close.take() {
            tracing::debug!(attempt_id, code, reason, "sending close deferred from handshake");
            let _ = writer_tx.send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })));
        }
        *state = WsState::Open {
            writer_tx,
            cancel: cancel.clone(),
        };
    }
    listener.on_open(attempt_id);

    let writer = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if websocket_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = websocket_tx.close().await;
    });

    let mut close_frame: Option<(u16, String)> = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(attempt_id, "websocket transport cancelled");
                writer.abort();
                *inner.state.lock() = WsState::Terminated;
                return;
            }
            msg = websocket_rx.next() => match msg {
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    listener.on_message(attempt_id, data);
                }
                Some(Ok(tungstenite::Message::Text(_))) => {
                    // binary is the sole application payload channel
                    tracing::debug!(attempt_id, "ignoring text websocket frame");
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                        .unwrap_or_else(|| (CloseCode::Normal.into(), String::new()));
                    tracing::debug!(attempt_id, code, reason, "received close frame");
                    listener.on_closing(attempt_id, code, &reason);
                    close_frame = Some((code, reason));
                }
                Some(Ok(other)) => {
                    tracing::trace!(?other, attempt_id, "skipping websocket control frame");
                }
                Some(Err(err)) => {
                    tracing::warn!(?err, attempt_id, "websocket read failed");
                    writer.abort();
                    *inner.state.lock() = WsState::Terminated;
                    listener.on_failure(attempt_id, TransportError::WebSocket(Box::new(err)), None);
                    return;
                }
                None => break,
            }
        }
    }

    let (code, reason) =
        close_frame.unwrap_or_else(|| (CLOSE_CODE_ABNORMAL, "connection closed abnormally".to_string()));
    *inner.state.lock() = WsState::Terminated;
    listener.on_closed(attempt_id, code, &reason);
}

#[cfg(test)]
mod tests {
    use super::build_request;
    use crate::options::ConnectOptions;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_carries_bearer_token() {
        let request = build_request(
            "ws://localhost:8080/signal?room=1",
            "tok123",
            &ConnectOptions::default(),
        )
        .unwrap();

        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            "Bearer tok123"
        );
        assert!(request.headers().get("User-Agent").is_none());
        assert_eq!(request.uri().to_string(), "ws://localhost:8080/signal?room=1");
    }

    #[test]
    fn request_carries_user_agent_when_supplied() {
        let options = ConnectOptions {
            user_agent: Some("agentX".to_string()),
        };
        let request = build_request("ws://localhost:8080/signal", "tok", &options).unwrap();

        assert_eq!(request.headers().get("User-Agent").unwrap(), "agentX");
    }

    #[test]
    fn empty_user_agent_is_not_sent() {
        let options = ConnectOptions {
            user_agent: Some(String::new()),
        };
        let request = build_request("ws://localhost:8080/signal", "tok", &options).unwrap();

        assert!(request.headers().get("User-Agent").is_none());
    }
}
