use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cleanup::{Cleaner, CleanupRequest};

/// Commands sent to the queue's worker task.
enum QueueCommand {
    Cleanup(CleanupRequest),
    /// Stop once everything queued before has been processed.
    Shutdown,
}

/// Cleans up this client's own attempts in the background.
///
/// Requests are processed in the order they were added, each no earlier than
/// its `when_ready`. A request that fails is dropped; the attempt's entry
/// stays in its ATR and lost-transaction cleanup picks it up once it expires.
pub struct CleanupWorkQueue {
    sender: mpsc::UnboundedSender<QueueCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl CleanupWorkQueue {
    /// Spawns the worker on the current Tokio runtime.
    pub fn start(cleaner: Arc<Cleaner>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueueCommand>();
        let processed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let worker_processed = Arc::clone(&processed);
        let worker_failed = Arc::clone(&failed);

        let worker = tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                let request = match command {
                    QueueCommand::Cleanup(request) => request,
                    QueueCommand::Shutdown => {
                        debug!("Cleanup queue shutting down");
                        break;
                    }
                };
                tokio::time::sleep_until(request.when_ready.into()).await;
                match cleaner.process(&request).await {
                    Ok(outcome) => {
                        debug!(
                            "Cleanup of attempt {} finished: {:?}",
                            request.attempt_id, outcome
                        );
                        worker_processed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!(
                            "Cleanup of attempt {} failed, leaving it to lost-transaction cleanup: {}",
                            request.attempt_id, e
                        );
                        worker_failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });

        Self {
            sender,
            worker: Mutex::new(Some(worker)),
            processed,
            failed,
        }
    }

    pub fn add(&self, request: CleanupRequest) {
        let attempt_id = request.attempt_id.clone();
        if self.sender.send(QueueCommand::Cleanup(request)).is_err() {
            warn!(
                "Cleanup queue is shut down, attempt {} left to lost-transaction cleanup",
                attempt_id
            );
        }
    }

    /// Requests processed successfully so far.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Processes everything already queued, then stops the worker.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(QueueCommand::Shutdown);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Cleanup queue worker did not stop cleanly: {}", e);
            }
            info!(
                "Cleanup queue stopped after {} request(s), {} failed",
                self.processed_count(),
                self.failed_count()
            );
        }
    }
}
