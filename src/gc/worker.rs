use crate::core::{EngineError, Result};
use crate::engine::Engine;
use log::warn;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Background task running the GC pipeline on a fixed interval.
pub struct GcWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    /// Signals the worker to stop and waits for it to finish. A run in
    /// progress is completed first.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| EngineError::unexpected(format!("gc worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the GC worker. The first run happens one interval after start.
pub fn spawn_gc_worker(engine: Engine) -> GcWorker {
    let interval = Duration::from_secs(engine.config().gc.interval_secs.max(1));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(err) = engine.run_gc().await {
                        warn!("scheduled gc run aborted: {}", err);
                    }
                }
            }
        }
    });

    GcWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
