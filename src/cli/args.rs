use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rnaseq-queue", version = "0.1.0")]
pub struct Arguments {
    #[arg(short = 's', long = "samples", help = "Local sample sheet: sample_id<TAB>fastq[;fastq2] per line")]
    pub sample_sheet: Option<String>,

    #[arg(long = "remote", help = "Pre-resolved remote sheet: sample_id<TAB>run accessions per line")]
    pub remote_sheet: Option<String>,

    #[arg(long, help = "SRA/GEO series accession, resolved to run groupings through pysradb")]
    pub series: Option<String>,

    #[arg(long = "skip", help = "Newline-delimited sample_ids to exclude from the queue")]
    pub skip_list: Option<String>,

    #[arg(short = 'w', long = "workdir", help = "Run-scoped working area; queue state lives under <workdir>/queue")]
    pub work_dir: Option<String>,

    #[arg(short = 'o', long = "out")]
    pub out_dir: Option<String>,

    #[arg(short = 'q', long, default_value_t = 8, help = "Maximum samples in flight at once")]
    pub queue_size: usize,

    #[arg(long, default_value_t = false)]
    pub hisat2: bool,

    #[arg(long, default_value_t = false)]
    pub kallisto: bool,

    #[arg(long, default_value_t = false)]
    pub salmon: bool,

    #[arg(long, help = "Index for the selected quantifier (hisat2 basename, kallisto .idx, or salmon dir)")]
    pub index: Option<String>,

    #[arg(long, help = "GTF annotation for featureCounts (hisat2 branch)")]
    pub gtf: Option<String>,

    #[arg(long, default_value_t = false, help = "Retain per-sample FASTQs instead of reclaiming them")]
    pub publish_fastq: bool,

    #[arg(long, default_value_t = false, help = "Retain BAMs instead of reclaiming them (hisat2 branch)")]
    pub publish_bam: bool,

    #[arg(long, default_value_t = false, help = "Assemble the gene counts matrix after the last sample")]
    pub counts: bool,

    #[arg(long, default_value_t = false, help = "Assemble the TPM matrix after the last sample")]
    pub tpm: bool,

    #[arg(long, help = "External matrix-assembly command run over the finished outputs")]
    pub matrix_cmd: Option<String>,

    #[arg(long, help = "External report command run after matrix assembly")]
    pub report_cmd: Option<String>,

    #[arg(short = 't', long, default_value_t = 8)]
    pub threads: usize,

    #[arg(long, default_value_t = 1000)]
    pub lock_poll_ms: u64,

    #[arg(long, default_value_t = 6000)]
    pub lock_retries: u64,

    #[arg(long, default_value_t = 0, help = "Abort if the completion join sees no signal for this long; 0 disables")]
    pub join_timeout_secs: u64,

    #[arg(long, default_value_t = 500)]
    pub watch_interval_ms: u64,

    #[arg(long, default_value_t = false, help = "Skip tool presence checks at startup")]
    pub no_version_check: bool,

    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}
