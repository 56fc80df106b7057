// src/scheduler/admission.rs: the gate that bounds how many samples are
// in flight. All queue transitions after the cold-start seed go through
// the lock-guarded advance() path, one completion at a time.

use anyhow::Result;
use log::{info, warn};

use crate::config::defs::{ADMITTED_DIR, DONE_DIR, PipelineError, STAGED_DIR};
use crate::scheduler::lock::QueueLock;
use crate::scheduler::queue::{SampleDescriptor, SampleQueue};

/// What advance() found once the completed record was filed.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// One staged item moved into admitted.
    Admitted(SampleDescriptor),
    /// Nothing left to stage, but earlier admissions are still running.
    Drained,
    /// Staged and admitted are both empty: the run is complete.
    Terminal,
}

pub struct AdmissionController {
    queue: SampleQueue,
    lock: QueueLock,
    queue_size: usize,
}

impl AdmissionController {
    pub fn new(queue: SampleQueue, lock: QueueLock, queue_size: usize) -> Self {
        AdmissionController {
            queue,
            lock,
            queue_size,
        }
    }

    /// Cold-start bootstrap: admits up to `queue_size` staged items (all of
    /// them if fewer), bypassing the single-step lock path. Runs before any
    /// watcher or branch task exists, so nothing else can be mutating the
    /// queue yet.
    ///
    /// # Returns
    /// Number of items admitted.
    pub fn seed(&self) -> Result<usize, PipelineError> {
        let staged = self
            .queue
            .list_names(&self.queue.staged_dir())
            .map_err(queue_err)?;
        let batch = staged.len().min(self.queue_size);
        for name in staged.iter().take(batch) {
            let id = record_stem(name);
            self.queue
                .transition(id, STAGED_DIR, ADMITTED_DIR)
                .map_err(queue_err)?;
        }
        info!(
            "Seeded {} of {} staged samples (queue size {})",
            batch,
            staged.len(),
            self.queue_size
        );
        Ok(batch)
    }

    /// The steady-state step, invoked once per sample completion: under the
    /// queue lock, files the completed record into `done`, then admits the
    /// lexicographically-lowest staged record.
    pub async fn advance(&self, completed_id: &str) -> Result<AdvanceOutcome, PipelineError> {
        let _guard = self.lock.acquire().await?;

        self.queue
            .transition(completed_id, ADMITTED_DIR, DONE_DIR)
            .map_err(|e| PipelineError::QueueState(format!("Filing completion: {}", e)))?;

        let staged = self
            .queue
            .list_names(&self.queue.staged_dir())
            .map_err(queue_err)?;

        match staged.first() {
            Some(name) => {
                let admitted = self
                    .queue
                    .admitted_count()
                    .map_err(queue_err)?;
                if admitted >= self.queue_size {
                    warn!(
                        "Admitted count {} already at bound {}; not admitting",
                        admitted, self.queue_size
                    );
                    return Ok(AdvanceOutcome::Drained);
                }
                let id = record_stem(name);
                self.queue
                    .transition(id, STAGED_DIR, ADMITTED_DIR)
                    .map_err(queue_err)?;
                let desc = SampleQueue::read_record(
                    &self.queue.admitted_dir().join(name),
                )
                .map_err(queue_err)?;
                info!("Admitted {} after {} completed", desc.sample_id, completed_id);
                Ok(AdvanceOutcome::Admitted(desc))
            }
            None => {
                let admitted = self
                    .queue
                    .admitted_count()
                    .map_err(queue_err)?;
                if admitted == 0 {
                    info!("Queue drained: {} was the last sample", completed_id);
                    Ok(AdvanceOutcome::Terminal)
                } else {
                    Ok(AdvanceOutcome::Drained)
                }
            }
        }
    }
}

fn record_stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

fn queue_err(e: anyhow::Error) -> PipelineError {
    PipelineError::QueueState(e.to_string())
}
