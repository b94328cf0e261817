//! Handle controlling the background expiry sweeper.

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Returned by [`ChatHistoryManager::spawn_sweeper`](crate::ChatHistoryManager::spawn_sweeper)
/// and [`HistoryBuilder::build_with_sweeper`](crate::HistoryBuilder::build_with_sweeper).
///
/// Owns the shutdown signal and the task's join handle. Dropping the handle
/// without calling [`shutdown`](Self::shutdown) closes the signal channel,
/// which also stops the task at its next wake-up.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub(crate) fn new(shutdown: oneshot::Sender<()>, worker: JoinHandle<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
            worker: Some(worker),
        }
    }

    /// `true` once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the sweeper and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.take() {
            if let Err(e) = handle.await {
                tracing::error!("Sweeper task failed: {e}");
            }
        }
    }
}
