//! Background task that expires and evicts entries on an interval.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::EngineCore;

pub(crate) struct Janitor {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub(crate) fn spawn<K, V>(core: Arc<EngineCore<K, V>>) -> Self
    where
        K: PartialEq + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(core, shutdown_rx));
        info!("Started cache janitor");
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Ask the loop to exit without waiting for it
    pub(crate) fn signal(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Ask the loop to exit and wait until it has.
    ///
    /// A pass already in progress is finished first.
    pub(crate) async fn stop(self) {
        self.signal();
        if let Err(e) = self.handle.await {
            error!("Cache janitor terminated abnormally: {}", e);
        }
        info!("Stopped cache janitor");
    }
}

async fn run<K, V>(core: Arc<EngineCore<K, V>>, mut shutdown_rx: broadcast::Receiver<()>)
where
    K: PartialEq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    loop {
        let interval = core.cleanup_interval().await;

        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!("Received shutdown signal");
                break;
            }

            _ = tokio::time::sleep(interval) => {}
        }

        let stats = core.run_cleanup().await;
        if stats.removed() > 0 || stats.failures > 0 {
            info!(
                expired = stats.expired,
                evicted = stats.evicted,
                failures = stats.failures,
                persisted = stats.persisted,
                "Cache cleanup finished"
            );
        } else {
            debug!(persisted = stats.persisted, "Cache cleanup found nothing to remove");
        }
    }
}
