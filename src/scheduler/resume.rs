// src/scheduler/resume.rs: crash/restart bootstrap over persisted queue state.

use anyhow::Result;
use log::{info, warn};

use crate::config::defs::{ADMITTED_DIR, STAGED_DIR};
use crate::scheduler::queue::SampleQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Stage, seed and run the admission loop as usual.
    Normal,
    /// A prior run finished every sample; go straight to post-processing.
    PostProcessOnly,
}

/// Moves any record lingering in `admitted` back to `staged`. In-progress
/// state from a dead process cannot be trusted; the sample will be
/// re-admitted and its stages re-run (or cache-skipped) from scratch.
///
/// # Returns
/// Number of records un-admitted.
pub fn repair(queue: &SampleQueue) -> Result<usize> {
    let lingering = queue.list_names(&queue.admitted_dir())?;
    for name in &lingering {
        let id = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
        queue.transition(id, ADMITTED_DIR, STAGED_DIR)?;
    }
    if !lingering.is_empty() {
        warn!(
            "Un-admitted {} in-flight samples left by a prior run",
            lingering.len()
        );
    }
    Ok(lingering.len())
}

/// Decides the bootstrap path after repair and re-enumeration. An empty
/// `staged` with finished samples on record means everything already ran:
/// fire post-processing directly instead of waiting on completions that
/// will never arrive.
pub fn mode(queue: &SampleQueue) -> Result<ResumeMode> {
    if queue.staged_count()? == 0 && queue.done_count()? > 0 {
        info!(
            "All {} samples already done; resuming at post-processing",
            queue.done_count()?
        );
        Ok(ResumeMode::PostProcessOnly)
    } else {
        Ok(ResumeMode::Normal)
    }
}
