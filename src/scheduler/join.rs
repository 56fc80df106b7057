// src/scheduler/join.rs: keyed reference-count join. Every consumer of an
// artifact signals here; the counter for a key fires exactly once, the
// instant the expected number of signals has arrived, then is discarded.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::error;

use crate::config::defs::{ArtifactClass, QuantTool};

pub type JoinKey = (String, ArtifactClass);

/// How many distinct consumers each artifact class has under the active
/// branch. Derived once at startup so a topology change here is the only
/// place counts can drift.
#[derive(Debug, Clone, Copy)]
pub struct BranchPlan {
    tool: QuantTool,
}

impl BranchPlan {
    pub fn new(tool: QuantTool) -> Self {
        BranchPlan { tool }
    }

    pub fn expected(&self, class: ArtifactClass) -> u32 {
        match class {
            // FASTQC plus the quantifier, on every branch.
            ArtifactClass::Fastq => 2,
            // featureCounts, hisat2 branch only.
            ArtifactClass::Bam => match self.tool {
                QuantTool::Hisat2 => 1,
                QuantTool::Kallisto | QuantTool::Salmon => 0,
            },
            ArtifactClass::Sample => 1,
            // Metadata marker + raw-data-ready, in either order.
            ArtifactClass::Rendezvous => 2,
        }
    }
}

/// Concurrency-safe accumulator over `(sample_id, artifact_class)` keys.
/// Different keys land on different map shards and do not block each
/// other; same-key arrivals serialize on the entry.
pub struct CompletionJoin {
    counts: DashMap<JoinKey, u32>,
    last_signal: Mutex<Instant>,
}

impl CompletionJoin {
    pub fn new() -> Self {
        CompletionJoin {
            counts: DashMap::new(),
            last_signal: Mutex::new(Instant::now()),
        }
    }

    /// Records one completion signal for the key.
    ///
    /// # Arguments
    ///
    /// * `sample_id` - Key owner.
    /// * `class` - Artifact class the signal is for.
    /// * `expected` - Consumer count for this key's class under the active branch.
    ///
    /// # Returns
    /// true exactly once per key, on the signal that makes received == expected.
    pub fn signal(&self, sample_id: &str, class: ArtifactClass, expected: u32) -> bool {
        if let Ok(mut t) = self.last_signal.lock() {
            *t = Instant::now();
        }
        if expected == 0 {
            error!(
                "Signal for {}/{} with zero expected consumers; branch plan mismatch",
                sample_id, class
            );
            return false;
        }
        match self.counts.entry((sample_id.to_string(), class)) {
            Entry::Vacant(vacant) => {
                if expected == 1 {
                    true
                } else {
                    vacant.insert(1);
                    false
                }
            }
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() += 1;
                if *occupied.get() >= expected {
                    if *occupied.get() > expected {
                        error!(
                            "Key {}/{} exceeded expected count {}; firing anyway was refused",
                            sample_id, class, expected
                        );
                        occupied.remove();
                        return false;
                    }
                    occupied.remove();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Keys still waiting on signals, formatted for diagnostics.
    pub fn pending(&self) -> Vec<String> {
        self.counts
            .iter()
            .map(|e| format!("{}/{} ({} received)", e.key().0, e.key().1, e.value()))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn since_last_signal(&self) -> Duration {
        self.last_signal
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

impl Default for CompletionJoin {
    fn default() -> Self {
        Self::new()
    }
}
