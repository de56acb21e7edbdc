//! Background removal of expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::layer::CacheLayer;

/// Handle to a running sweeper task.
///
/// Dropping the handle also stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl CacheLayer {
    /// Start a task removing expired entries every `sweep_interval`.
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// dropped. Must be called inside a Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let cache = Arc::downgrade(self);
        let period = self.config().sweep_interval.max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            info!(removed, remaining = cache.len(), "Swept expired cache entries");
                        }
                    }
                }
            }
            debug!("Cache sweeper stopped");
        });

        SweeperHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}
