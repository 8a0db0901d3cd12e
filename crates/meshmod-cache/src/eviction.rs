//! Background eviction task.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a periodic eviction task. Dropping it stops the task.
#[derive(Debug)]
pub struct EvictionTask {
    handle: JoinHandle<()>,
}

impl EvictionTask {
    /// Run `tick` every `interval` until it returns `false`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn_async(interval, move || std::future::ready(tick()))
    }

    /// Like [`EvictionTask::spawn`] for sweeps that need to await, such as
    /// ones deleting files.
    pub fn spawn_async<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !tick().await {
                    debug!("eviction target dropped, stopping eviction task");
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Stop the task.
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for EvictionTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
