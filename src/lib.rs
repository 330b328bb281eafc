pub mod error;
pub mod mux;
pub mod options;
pub mod transport;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use error::TransportError;
pub use options::ConnectOptions;
pub use transport::quic::QuicTransport;
pub use transport::websocket::WebSocketTransport;
pub use transport::{AttemptId, SignalTransport, TransportFactory, TransportListener};
