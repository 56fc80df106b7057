// src/scheduler/mod.rs: admission-control core. Components communicate
// over the typed buses owned here; nothing scheduler-wide lives in a
// global.

pub mod admission;
pub mod join;
pub mod lock;
pub mod queue;
pub mod reclaim;
pub mod resume;
pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::defs::{PipelineError, PublishPolicy, RunConfig};
use admission::AdmissionController;
use join::{BranchPlan, CompletionJoin};
use lock::QueueLock;
use queue::{SampleDescriptor, SampleQueue};
use reclaim::ReclaimRequest;

/// The run's event buses. One instance per run, created before any task
/// spawns; receivers are moved out to the component that consumes them.
pub struct Buses {
    pub admitted_tx: mpsc::Sender<SampleDescriptor>,
    pub admitted_rx: mpsc::Receiver<SampleDescriptor>,
    pub completion_tx: mpsc::Sender<String>,
    pub completion_rx: mpsc::Receiver<String>,
    pub reclaim_tx: mpsc::Sender<ReclaimRequest>,
    pub reclaim_rx: mpsc::Receiver<ReclaimRequest>,
    pub fatal_tx: mpsc::Sender<PipelineError>,
    pub fatal_rx: mpsc::Receiver<PipelineError>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl Buses {
    pub fn new(capacity: usize) -> Self {
        let (admitted_tx, admitted_rx) = mpsc::channel(capacity);
        let (completion_tx, completion_rx) = mpsc::channel(capacity);
        let (reclaim_tx, reclaim_rx) = mpsc::channel(capacity);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Buses {
            admitted_tx,
            admitted_rx,
            completion_tx,
            completion_rx,
            reclaim_tx,
            reclaim_rx,
            fatal_tx,
            fatal_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }
}

/// Queue, admission gate, and completion join for one run.
pub struct Scheduler {
    pub queue: SampleQueue,
    pub admission: AdmissionController,
    pub join: Arc<CompletionJoin>,
    pub plan: BranchPlan,
    pub publish: PublishPolicy,
}

impl Scheduler {
    pub fn new(config: &RunConfig) -> Result<Self> {
        let queue = SampleQueue::open(&config.work_dir)?;
        let lock = QueueLock::new(
            queue.lock_path(),
            config.args.lock_poll_ms,
            config.args.lock_retries,
        );
        let admission =
            AdmissionController::new(queue.clone(), lock, config.args.queue_size);
        Ok(Scheduler {
            queue,
            admission,
            join: Arc::new(CompletionJoin::new()),
            plan: BranchPlan::new(config.tool),
            publish: config.publish,
        })
    }

    /// Drains the reclaim bus, hole-punching each artifact whose refcount
    /// reached zero. Reclaim failures cost disk, not correctness: logged
    /// and skipped.
    pub fn spawn_reclaim_executor(
        &self,
        mut reclaim_rx: mpsc::Receiver<ReclaimRequest>,
    ) -> JoinHandle<()> {
        let publish = self.publish;
        tokio::spawn(async move {
            while let Some(req) = reclaim_rx.recv().await {
                if let Err(e) = reclaim::execute(&req, &publish) {
                    error!(
                        "Reclaim of {} for {} failed: {}",
                        req.path.display(),
                        req.sample_id,
                        e
                    );
                }
            }
        })
    }

    /// Optional stall watchdog over the completion join. Fires a fatal
    /// error when counters are outstanding and no signal has arrived
    /// within `timeout`.
    pub fn spawn_join_watchdog(
        &self,
        timeout: Duration,
        fatal_tx: mpsc::Sender<PipelineError>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let join = Arc::clone(&self.join);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !join.is_idle() && join.since_last_signal() > timeout {
                            let pending = join.pending();
                            error!("Join watchdog tripped; pending keys: {:?}", pending);
                            let _ = fatal_tx.send(PipelineError::JoinStalled { pending }).await;
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Join watchdog shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }
}
