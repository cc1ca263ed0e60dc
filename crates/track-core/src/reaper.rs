//! Stale subscription reaper.
//!
//! A background task that periodically runs a sweep over the subscription
//! index. Eager compaction handles the common case; the reaper bounds
//! memory growth for whatever races leave behind.

use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running reaper task.
///
/// The task keeps ticking until [`shutdown`](Self::shutdown) is called or
/// the handle is dropped. A failing tick is logged and never terminates the
/// schedule.
#[derive(Debug)]
pub struct StaleSubscriptionReaper {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StaleSubscriptionReaper {
    /// Spawn a reaper driving the given sweep on a fixed interval.
    ///
    /// The sweep reports how many entries it removed. The broker wires this
    /// to [`sweep_empty`](crate::topics::TopicSubscriptionIndex::sweep_empty);
    /// anything with the same shape can be driven in tests.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(sweep: F, interval: Duration) -> Self
    where
        F: Fn() -> usize + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would sweep an index that cannot have
            // accumulated anything yet.
            ticker.tick().await;

            info!(interval_secs = interval.as_secs(), "Reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::tick(&sweep);
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reaper shutting down");
                        break;
                    }
                }
            }
        });

        Self { shutdown_tx, task }
    }

    /// One sweep. A panicking sweep must not kill the schedule.
    fn tick<F: Fn() -> usize>(sweep: &F) {
        match std::panic::catch_unwind(AssertUnwindSafe(|| sweep())) {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "Reaped empty topics");
                } else {
                    debug!("Reaper tick: nothing to remove");
                }
            }
            Err(_) => warn!("Reaper tick panicked; next tick still fires"),
        }
    }

    /// Stop the reaper and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }

    /// Stop the reaper without waiting.
    pub fn abort(&self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
    }
}
