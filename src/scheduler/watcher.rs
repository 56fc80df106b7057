// src/scheduler/watcher.rs: feeds newly admitted samples to the router.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::scheduler::queue::{SampleDescriptor, SampleQueue};

/// Polls the `admitted` location and sends each descriptor over the
/// admitted bus exactly once. The seen-set starts pre-loaded with every
/// record already in `done`, so a restart never re-emits finished items.
/// Stops when the shutdown flag flips or the receiving side goes away.
pub fn spawn_watcher(
    queue: SampleQueue,
    interval_ms: u64,
    admitted_tx: mpsc::Sender<SampleDescriptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut seen: HashSet<String> = queue
            .list_names(&queue.done_dir())?
            .into_iter()
            .collect();
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for name in queue.list_names(&queue.admitted_dir())? {
                        if seen.contains(&name) {
                            continue;
                        }
                        let desc = SampleQueue::read_record(&queue.admitted_dir().join(&name))?;
                        seen.insert(name);
                        debug!("Watcher observed admitted sample {}", desc.sample_id);
                        if admitted_tx.send(desc).await.is_err() {
                            // Router side closed; the run is over.
                            return Ok(());
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Watcher shutting down");
                        return Ok(());
                    }
                }
            }
        }
    })
}
