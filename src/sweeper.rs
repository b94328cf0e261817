//! Background task that prunes expired sessions and elapsed rate-limit
//! windows.
//!
//! This module is internal. Users start it through
//! [`ChatHistoryManager::spawn_sweeper`](crate::ChatHistoryManager::spawn_sweeper)
//! and stop it through [`SweeperHandle`](crate::SweeperHandle).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{self, MissedTickBehavior};

use crate::history::ChatHistoryManager;
use crate::storage::Storage;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) async fn run<L: Storage, T: Storage>(
    manager: Arc<ChatHistoryManager<L, T>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    sweep_interval: Duration,
) {
    let mut interval = time::interval(sweep_interval.max(MIN_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Skip the first immediate tick
    interval.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                tracing::info!("Sweeper shut down");
                return;
            }

            _ = interval.tick() => {
                let sessions = manager.sweep_expired().await;
                let windows = manager.guard().purge_rate_limits();
                if sessions > 0 || windows > 0 {
                    tracing::debug!(
                        "Swept {sessions} expired session(s) and {windows} rate-limit window(s)"
                    );
                }
            }
        }
    }
}
