use crate::transport::AttemptId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Per-transport sequential executor.
///
/// All listener callbacks for one transport instance are funneled through a
/// single dedicated worker thread, giving the listener a strictly ordered,
/// non-overlapping event stream even when the underlying technology reports
/// events from several native threads at once.
pub(crate) struct ListenerDispatch {
    attempt_id: AttemptId,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    shut_down: Arc<AtomicBool>,
}

impl ListenerDispatch {
    pub(crate) fn new(attempt_id: AttemptId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let shut_down = Arc::new(AtomicBool::new(false));

        let flag = shut_down.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("signal-dispatch-{attempt_id}"))
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    // Jobs queued before shutdown are dropped, not delivered.
                    if flag.load(Ordering::Acquire) {
                        continue;
                    }
                    job();
                }
                tracing::trace!(attempt_id, "listener dispatch worker finished");
            });

        let tx = match spawned {
            Ok(_) => Some(tx),
            Err(err) => {
                tracing::error!(
                    ?err,
                    attempt_id,
                    "failed to spawn listener dispatch worker, all events will be dropped"
                );
                None
            }
        };

        Self {
            attempt_id,
            tx: Mutex::new(tx),
            shut_down,
        }
    }

    /// Enqueues a unit of work. Must never error back into the native
    /// callback path: after shutdown the job is silently dropped, observable
    /// only through diagnostics.
    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.shut_down.load(Ordering::Acquire) {
            tracing::debug!(
                attempt_id = self.attempt_id,
                "dropping event submitted after dispatch shutdown"
            );
            return;
        }
        match &*self.tx.lock() {
            Some(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    tracing::debug!(
                        attempt_id = self.attempt_id,
                        "dispatch worker gone, dropping event"
                    );
                }
            }
            None => {
                tracing::debug!(
                    attempt_id = self.attempt_id,
                    "dispatch unavailable, dropping event"
                );
            }
        }
    }

    /// Shuts the worker down. Idempotent; queued-but-undelivered jobs are
    /// dropped. Called after the terminal callback has been dispatched, or
    /// immediately upon cancellation.
    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(attempt_id = self.attempt_id, "shutting down listener dispatch");
        *self.tx.lock() = None;
    }
}

impl Drop for ListenerDispatch {
    fn drop(&mut self) {
        self.shutdown();
    }
}
