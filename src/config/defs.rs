use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use lazy_static::lazy_static;
use log::LevelFilter;

use crate::cli::Arguments;

// External software
pub const PREFETCH_TAG: &str = "prefetch";
pub const FASTERQ_DUMP_TAG: &str = "fasterq-dump";
pub const FASTQC_TAG: &str = "fastqc";
pub const HISAT2_TAG: &str = "hisat2";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const FEATURECOUNTS_TAG: &str = "featureCounts";
pub const KALLISTO_TAG: &str = "kallisto";
pub const SALMON_TAG: &str = "salmon";
pub const PYSRADB_TAG: &str = "pysradb";

lazy_static! {
    pub static ref TOOL_VERSIONS: HashMap<&'static str, f32> = {
        let mut m = HashMap::new();
        m.insert(PREFETCH_TAG, 3.0);
        m.insert(FASTERQ_DUMP_TAG, 3.0);
        m.insert(FASTQC_TAG, 0.12);
        m.insert(HISAT2_TAG, 2.2);
        m.insert(SAMTOOLS_TAG, 1.20);
        m.insert(FEATURECOUNTS_TAG, 2.0);
        m.insert(KALLISTO_TAG, 0.48);
        m.insert(SALMON_TAG, 1.10);

        m
    };
}

// Queue directory names under <workdir>/queue
pub const STAGED_DIR: &str = "staged";
pub const ADMITTED_DIR: &str = "admitted";
pub const DONE_DIR: &str = "done";
pub const QUEUE_LOCK_FILE: &str = "queue.lock";
pub const RECORD_EXT: &str = "sample";

/// The quantifier branch a run is locked to. Chosen once at startup;
/// every sample goes down the same branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantTool {
    Hisat2,
    Kallisto,
    Salmon,
}

impl QuantTool {
    pub fn tag(&self) -> &'static str {
        match self {
            QuantTool::Hisat2 => HISAT2_TAG,
            QuantTool::Kallisto => KALLISTO_TAG,
            QuantTool::Salmon => SALMON_TAG,
        }
    }
}

impl fmt::Display for QuantTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Classes of large intermediates tracked by the completion join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactClass {
    /// Per-sample FASTQ, read by FASTQC and the quantifier.
    Fastq,
    /// Sorted alignment, hisat2 branch only, read by featureCounts.
    Bam,
    /// The whole-sample terminal signal.
    Sample,
    /// Metadata/raw-data rendezvous ahead of QC and quantification.
    Rendezvous,
}

impl fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactClass::Fastq => "fastq",
            ArtifactClass::Bam => "bam",
            ArtifactClass::Sample => "sample",
            ArtifactClass::Rendezvous => "rendezvous",
        };
        f.write_str(s)
    }
}

/// Which artifact classes survive cleanup. A retained class turns the
/// fired reclaim callback into a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishPolicy {
    pub fastq: bool,
    pub bam: bool,
}

impl PublishPolicy {
    pub fn retains(&self, class: ArtifactClass) -> bool {
        match class {
            ArtifactClass::Fastq => self.fastq,
            ArtifactClass::Bam => self.bam,
            ArtifactClass::Sample | ArtifactClass::Rendezvous => true,
        }
    }
}

pub struct RunConfig {
    pub cwd: PathBuf,
    pub work_dir: PathBuf,
    pub out_dir: PathBuf,
    pub args: Arguments,
    pub tool: QuantTool,
    pub publish: PublishPolicy,
    pub threads: usize,
    pub log_level: LevelFilter,
}

#[derive(Debug)]
pub enum PipelineError {
    InvalidConfig(String),
    /// Lock acquisition exhausted its retry budget. Not retryable: the
    /// conserved-count invariant cannot be checked without the lock.
    LockTimeout { attempts: u64 },
    /// The completion join saw no signal for longer than the watchdog
    /// window while counters were still outstanding.
    JoinStalled { pending: Vec<String> },
    ToolExecution { tool: String, error: String },
    QueueState(String),
    IOError(String),
    Other(anyhow::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            PipelineError::LockTimeout { attempts } => write!(
                f,
                "Could not obtain queue lock after {} attempts; aborting run",
                attempts
            ),
            PipelineError::JoinStalled { pending } => write!(
                f,
                "Completion join stalled; still waiting on: {}",
                pending.join(", ")
            ),
            PipelineError::ToolExecution { tool, error } => {
                write!(f, "{} failed: {}", tool, error)
            }
            PipelineError::QueueState(msg) => write!(f, "Queue state error: {}", msg),
            PipelineError::IOError(msg) => write!(f, "I/O error: {}", msg),
            PipelineError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        PipelineError::Other(e)
    }
}
