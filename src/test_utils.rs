use crate::error::TransportError;
use crate::transport::{AttemptId, TransportListener};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Bytes),
    Closing { code: u16, reason: String },
    Closed { code: u16, reason: String },
    Failure { message: String, code: Option<i32> },
}

/// Listener that records every callback in arrival order and forwards it to
/// an awaitable channel.
pub struct RecordingListener {
    tx: mpsc::UnboundedSender<TransportEvent>,
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                events: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    /// Full callback history, in delivery order.
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: TransportEvent) {
        self.events.lock().push(event.clone());
        let _ = self.tx.send(event);
    }
}

impl TransportListener for RecordingListener {
    fn on_open(&self, _attempt_id: AttemptId) {
        self.record(TransportEvent::Open);
    }

    fn on_message(&self, _attempt_id: AttemptId, data: Bytes) {
        self.record(TransportEvent::Message(data));
    }

    fn on_closing(&self, _attempt_id: AttemptId, code: u16, reason: &str) {
        self.record(TransportEvent::Closing {
            code,
            reason: reason.to_string(),
        });
    }

    fn on_closed(&self, _attempt_id: AttemptId, code: u16, reason: &str) {
        self.record(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    fn on_failure(
        &self,
        _attempt_id: AttemptId,
        error: TransportError,
        _diagnostic_context: Option<String>,
    ) {
        let code = match &error {
            TransportError::ConnectFailed { code, .. } => Some(*code),
            _ => None,
        };
        self.record(TransportEvent::Failure {
            message: error.to_string(),
            code,
        });
    }
}

pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    timeout: Duration,
) -> Option<TransportEvent> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}
