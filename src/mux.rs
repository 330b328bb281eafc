#[cfg(feature = "test-utils")]
pub mod mock;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Congestion control algorithm exposed by the multiplexed connection library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionControl {
    Reno,
    Cubic,
    Bbr,
    Bbr2,
}

/// Parameters for a single multiplexed connection, immutable once handed to
/// [`MuxConnector::create_connection`].
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub hostname: String,
    pub port: u16,
    pub idle_timeout: Duration,
    pub max_connections: u32,
    pub congestion_control: CongestionControl,
    pub ping_on: bool,
    pub ping_interval: Duration,
    /// Application protocol identifier negotiated during the handshake.
    pub alpn: String,
}

/// Entry point of the multiplexed connection library.
pub trait MuxConnector: Send + Sync + 'static {
    fn create_connection(
        &self,
        config: MuxConfig,
        handler: Arc<dyn MuxConnectionHandler>,
    ) -> anyhow::Result<Arc<dyn MuxConnection>>;
}

/// A single multiplexed connection. `connect` starts the handshake; its
/// outcome arrives via [`MuxConnectionHandler::on_connect_result`]. A nonzero
/// return from `connect` itself means the attempt was rejected outright.
pub trait MuxConnection: Send + Sync + 'static {
    fn connect(&self, url: &str, auth: &str) -> i32;

    fn close(&self);
}

/// A sub-channel within an established connection, created by the remote peer
/// before payload bytes may flow.
pub trait MuxStream: Send + Sync + 'static {
    fn id(&self) -> u64;

    /// Returns the library's result code; zero means the payload was accepted
    /// for transmission.
    fn send_data(&self, data: &[u8]) -> i32;
}

/// Event sink registered with a connection.
///
/// The library invokes these from its own internal threads, concurrently and
/// with no ordering guarantee between them; implementations must not assume a
/// delivery thread.
pub trait MuxConnectionHandler: Send + Sync + 'static {
    fn on_connect_result(&self, error_code: i32, message: String);

    fn on_stream_created(&self, stream: Arc<dyn MuxStream>);

    fn on_stream_closed(&self, stream: Arc<dyn MuxStream>);

    fn on_recv_data(&self, data: Bytes);

    /// Out-of-band command channel, never carrying application payloads.
    fn on_recv_cmd(&self, data: Bytes);

    /// Terminal: the connection was closed, gracefully or by the peer.
    fn on_closed(&self, reason: Option<String>);

    /// Terminal: an asynchronous fault on an otherwise healthy connection.
    fn on_exception(&self, message: String);
}
