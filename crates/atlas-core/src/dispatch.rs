//! Fire-and-forget notification dispatch on a dedicated worker thread.

use crate::backend::Notifier;
use crate::types::NotificationPayload;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::JoinHandle;

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

struct NotifyRequest {
    address: String,
    payload: NotificationPayload,
}

/// Handle to the notification worker.
///
/// [`dispatch`](Self::dispatch) only enqueues: a slow or failing notifier can
/// never delay or fail an attendance recording. Dropping the dispatcher
/// closes the queue and waits for queued notifications to drain.
pub struct NotificationDispatcher {
    tx: Option<SyncSender<NotifyRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn spawn<N>(mut notifier: N, queue_depth: usize) -> std::io::Result<Self>
    where
        N: Notifier + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<NotifyRequest>(queue_depth.max(1));

        let worker = std::thread::Builder::new()
            .name("atlas-notify".into())
            .spawn(move || {
                tracing::debug!("notification worker started");
                while let Ok(req) = rx.recv() {
                    match notifier.send(&req.address, &req.payload) {
                        Ok(()) => tracing::info!(
                            student = %req.payload.display_name,
                            status = %req.payload.status,
                            "notification sent"
                        ),
                        Err(e) => tracing::warn!(
                            error = %e,
                            student = %req.payload.display_name,
                            "notification failed"
                        ),
                    }
                }
                tracing::debug!("notification worker exiting");
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queue a notification. Drops it (with a warning) if the queue is full.
    pub fn dispatch(&self, address: &str, payload: NotificationPayload) {
        let Some(tx) = &self.tx else {
            return;
        };
        let req = NotifyRequest {
            address: address.to_string(),
            payload,
        };
        match tx.try_send(req) {
            Ok(()) => {}
            Err(TrySendError::Full(req)) => {
                tracing::warn!(student = %req.payload.display_name, "notification queue full; dropping");
            }
            Err(TrySendError::Disconnected(req)) => {
                tracing::warn!(student = %req.payload.display_name, "notification worker gone; dropping");
            }
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
