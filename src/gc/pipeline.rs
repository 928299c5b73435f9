use super::checkpoint::{CHECKPOINT_ID, Checkpoint, SaveCheckpoint, StepLog};
use super::steps::GcStep;
use crate::core::{EngineError, Result};
use crate::document::Document;
use crate::engine::Engine;
use crate::storage::{Collection, RowSource};
use log::warn;
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, event, info_span};

impl Engine {
    /// Runs every GC step in order. A step that exhausts its attempts aborts
    /// the run; the next run starts again from the first step.
    pub async fn run_gc(&self) -> Result<Checkpoint> {
        let span = info_span!("gc", today = %self.clock().today());
        self.gc_pass().instrument(span).await
    }

    /// Last checkpoint written by a GC run.
    pub async fn gc_checkpoint(&self) -> Result<Option<Checkpoint>> {
        match self
            .backend()
            .get(Collection::Checkpoints, CHECKPOINT_ID, 0)
            .await?
        {
            Some(row) => Ok(Some(Checkpoint::decode(&row)?)),
            None => Ok(None),
        }
    }

    async fn gc_pass(&self) -> Result<Checkpoint> {
        let policy = self.config().gc.clone();
        let today = self.clock().today();
        let mut checkpoint = Checkpoint::start(self.clock().now());
        let max_attempts = policy.step_backoffs_ms.len().max(1);

        for step in GcStep::ALL {
            let mut attempt = 0usize;
            loop {
                let delay_ms = policy.step_backoffs_ms.get(attempt).copied().unwrap_or(0);
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                attempt += 1;

                let started = Instant::now();
                let result = step.run(self, &policy, today).await;
                let mut entry = StepLog {
                    step: step.name().to_string(),
                    attempt: attempt as u32,
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..StepLog::default()
                };
                match &result {
                    Ok(stats) => entry.stats = stats.clone(),
                    Err(err) => entry.error = Some(err.to_string()),
                }
                checkpoint.log.push(entry);

                let Err(err) = result else {
                    self.save_checkpoint(&checkpoint).await;
                    break;
                };
                if attempt >= max_attempts {
                    event!(
                        Level::ERROR,
                        step = step.name(),
                        attempt,
                        error = %err,
                        "gc step exhausted its retries; run aborted"
                    );
                    checkpoint.aborted_at = Some(step.name().to_string());
                    checkpoint.finished_at = Some(self.clock().now());
                    self.save_checkpoint(&checkpoint).await;
                    return Err(err);
                }
                warn!(
                    "gc step {} retry (attempt {} of {}): {}",
                    step.name(),
                    attempt,
                    max_attempts,
                    err
                );
                self.save_checkpoint(&checkpoint).await;
            }
        }

        checkpoint.completed = true;
        checkpoint.finished_at = Some(self.clock().now());
        self.save_checkpoint(&checkpoint).await;
        event!(Level::INFO, steps = checkpoint.log.len(), "gc run completed");
        Ok(checkpoint)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) {
        let mut op = SaveCheckpoint {
            checkpoint: checkpoint.clone(),
        };
        if let Err(err) = self.run_internal(&mut op).await {
            warn!("gc checkpoint not saved: {}", describe(&err));
        }
    }
}

fn describe(err: &EngineError) -> String {
    format!("[{}] {}", err.code(), err)
}
