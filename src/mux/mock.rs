use crate::mux::{MuxConfig, MuxConnection, MuxConnectionHandler, MuxConnector, MuxStream};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Recording connector for driving the multiplexed transport in tests.
///
/// `create_connection` captures the config and handler; tests then inject
/// native events through [`MockConnector::handler`] and inspect what the
/// transport did through [`MockConnector::connection`].
#[derive(Default)]
pub struct MockConnector {
    created: Mutex<Option<Created>>,
    /// Result code `MuxConnection::connect` returns to the transport.
    pub connect_result: i32,
}

struct Created {
    config: MuxConfig,
    handler: Arc<dyn MuxConnectionHandler>,
    connection: Arc<MockConnection>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting(connect_result: i32) -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(None),
            connect_result,
        })
    }

    pub fn config(&self) -> MuxConfig {
        self.created().config.clone()
    }

    pub fn handler(&self) -> Arc<dyn MuxConnectionHandler> {
        self.created().handler.clone()
    }

    pub fn connection(&self) -> Arc<MockConnection> {
        self.created().connection.clone()
    }

    fn created(&self) -> parking_lot::MappedMutexGuard<'_, Created> {
        parking_lot::MutexGuard::map(self.created.lock(), |created| {
            created.as_mut().expect("create_connection not called yet")
        })
    }
}

impl MuxConnector for MockConnector {
    #[tracing::instrument(level = "debug", skip_all)]
    fn create_connection(
        &self,
        config: MuxConfig,
        handler: Arc<dyn MuxConnectionHandler>,
    ) -> anyhow::Result<Arc<dyn MuxConnection>> {
        let connection = Arc::new(MockConnection {
            connect_result: self.connect_result,
            connect_calls: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        });
        *self.created.lock() = Some(Created {
            config,
            handler,
            connection: connection.clone(),
        });
        Ok(connection)
    }
}

pub struct MockConnection {
    connect_result: i32,
    connect_calls: Mutex<Vec<ConnectCall>>,
    close_count: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub url: String,
    pub auth: String,
}

impl MockConnection {
    pub fn connect_calls(&self) -> Vec<ConnectCall> {
        self.connect_calls.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

impl MuxConnection for MockConnection {
    fn connect(&self, url: &str, auth: &str) -> i32 {
        self.connect_calls.lock().push(ConnectCall {
            url: url.to_string(),
            auth: auth.to_string(),
        });
        self.connect_result
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockStream {
    id: u64,
    /// Result code `send_data` returns to the transport.
    pub send_result: i32,
    sent: Mutex<Vec<Bytes>>,
}

impl MockStream {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            send_result: 0,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting(id: u64, send_result: i32) -> Arc<Self> {
        Arc::new(Self {
            id,
            send_result,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

impl MuxStream for MockStream {
    fn id(&self) -> u64 {
        self.id
    }

    fn send_data(&self, data: &[u8]) -> i32 {
        self.sent.lock().push(Bytes::copy_from_slice(data));
        self.send_result
    }
}
