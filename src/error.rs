use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed (code {code}): {message}")]
    ConnectFailed { code: i32, message: String },
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
    #[error("transport error: {0}")]
    Transport(#[from] Box<anyhow::Error>),
}
