use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use log::LevelFilter;
use tempfile::TempDir;

use rnaseq_queue::cli::Arguments;
use rnaseq_queue::config::defs::{PublishPolicy, QuantTool, RunConfig};
use rnaseq_queue::pipelines::quantify;
use rnaseq_queue::scheduler::queue::SampleQueue;

static STUB_BIN: OnceLock<PathBuf> = OnceLock::new();

/// Stub executables standing in for the bioinformatics tools. Each writes
/// the primary output its real counterpart would, and nothing else.
fn stub_bin() -> &'static Path {
    STUB_BIN.get_or_init(|| {
        let dir = TempDir::new().expect("stub dir");
        let dir = dir.keep();

        write_stub(
            &dir,
            "fastqc",
            r#"#!/bin/sh
out=""
while [ $# -gt 1 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -t) shift 2 ;;
    *) shift ;;
  esac
done
base=$(basename "$1")
stem="${base%.*}"
echo report > "$out/${stem}_fastqc.html"
"#,
        );
        write_stub(
            &dir,
            "kallisto",
            r#"#!/bin/sh
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
mkdir -p "$out"
printf 'target_id\tlength\teff_length\test_counts\ttpm\n' > "$out/abundance.tsv"
"#,
        );
        write_stub(
            &dir,
            "salmon",
            r#"#!/bin/sh
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
mkdir -p "$out"
printf 'Name\tLength\tEffectiveLength\tTPM\tNumReads\n' > "$out/quant.sf"
"#,
        );
        write_stub(
            &dir,
            "hisat2",
            r#"#!/bin/sh
printf '@HD\tVN:1.6\nread1\t0\tchr1\t1\t60\t4M\t*\t0\t0\tACGT\tFFFF\n'
"#,
        );
        write_stub(
            &dir,
            "samtools",
            r#"#!/bin/sh
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
cat > "$out"
"#,
        );
        write_stub(
            &dir,
            "featureCounts",
            r#"#!/bin/sh
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
printf 'Geneid\tCount\ng1\t10\n' > "$out"
"#,
        );
        write_stub(
            &dir,
            "prefetch",
            r#"#!/bin/sh
exit 0
"#,
        );
        write_stub(
            &dir,
            "fasterq-dump",
            r#"#!/bin/sh
out=""; prev=""; run=""
for a in "$@"; do
  if [ "$prev" = "-O" ]; then out="$a"; fi
  prev="$a"
  run="$a"
done
printf '@%s\nACGTACGT\n+\nFFFFFFFF\n' "$run" > "$out/$run.fastq"
"#,
        );

        let path = std::env::var("PATH").unwrap_or_default();
        unsafe {
            std::env::set_var("PATH", format!("{}:{}", dir.display(), path));
        }
        dir
    })
}

fn write_stub(dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, body).expect("write stub");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod stub");
}

fn make_config(
    tool: QuantTool,
    tmp: &Path,
    tweak: impl FnOnce(&mut Arguments),
) -> Arc<RunConfig> {
    stub_bin();
    let work_dir = tmp.join("work");
    let out_dir = tmp.join("results");
    fs::create_dir_all(&work_dir).expect("work dir");
    fs::create_dir_all(&out_dir).expect("out dir");

    let mut args = Arguments {
        queue_size: 2,
        threads: 1,
        lock_poll_ms: 5,
        lock_retries: 200,
        watch_interval_ms: 25,
        counts: true,
        index: Some("/ref/index".to_string()),
        gtf: Some("/ref/genes.gtf".to_string()),
        no_version_check: true,
        ..Default::default()
    };
    tweak(&mut args);

    Arc::new(RunConfig {
        cwd: tmp.to_path_buf(),
        work_dir,
        out_dir,
        tool,
        publish: PublishPolicy {
            fastq: args.publish_fastq,
            bam: args.publish_bam,
        },
        threads: 1,
        log_level: LevelFilter::Debug,
        args,
    })
}

fn write_local_inputs(tmp: &Path, ids: &[&str]) -> PathBuf {
    let data = tmp.join("data");
    fs::create_dir_all(&data).expect("data dir");
    let mut sheet = String::new();
    for id in ids {
        let fq = data.join(format!("{}.fastq", id));
        fs::write(&fq, format!("@{}\nACGT\n+\nFFFF\n", id)).expect("fastq");
        sheet.push_str(&format!("{}\t{}\n", id, fq.display()));
    }
    let sheet_path = tmp.join("samples.tsv");
    fs::write(&sheet_path, sheet).expect("sheet");
    sheet_path
}

#[tokio::test]
async fn test_local_drain_kallisto() -> Result<()> {
    let tmp = TempDir::new()?;
    let sheet = write_local_inputs(tmp.path(), &["s1", "s2", "s3"]);
    let config = make_config(QuantTool::Kallisto, tmp.path(), |args| {
        args.kallisto = true;
        args.sample_sheet = Some(sheet.to_string_lossy().to_string());
    });

    quantify::run(Arc::clone(&config)).await?;

    let queue = SampleQueue::open(&config.work_dir)?;
    assert_eq!(queue.staged_count()?, 0);
    assert_eq!(queue.admitted_count()?, 0);
    assert_eq!(queue.done_count()?, 3);

    for id in ["s1", "s2", "s3"] {
        assert!(
            config.out_dir.join(id).join("kallisto/abundance.tsv").exists(),
            "abundance missing for {}",
            id
        );
        assert!(
            config.out_dir.join(id).join(format!("{}_fastqc.html", id)).exists(),
            "fastqc report missing for {}",
            id
        );
        // Local single-file inputs are the user's data, never reclaimed.
        let raw = fs::read(tmp.path().join("data").join(format!("{}.fastq", id)))?;
        assert!(raw.starts_with(b"@"), "user input must stay intact");
    }

    let manifest = fs::read_to_string(config.out_dir.join("samples.done.txt"))?;
    let mut lines: Vec<&str> = manifest.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["s1", "s2", "s3"]);
    Ok(())
}

#[tokio::test]
async fn test_remote_download_merge_and_reclaim() -> Result<()> {
    let tmp = TempDir::new()?;
    let sheet_path = tmp.path().join("remote.tsv");
    fs::write(&sheet_path, "sR\tSRR1 SRR2\n")?;
    let config = make_config(QuantTool::Salmon, tmp.path(), |args| {
        args.salmon = true;
        args.remote_sheet = Some(sheet_path.to_string_lossy().to_string());
    });

    quantify::run(Arc::clone(&config)).await?;

    let queue = SampleQueue::open(&config.work_dir)?;
    assert_eq!(queue.done_count()?, 1);
    assert!(config.out_dir.join("sR/salmon/quant.sf").exists());

    // Two runs merged into one per-sample FASTQ, then sparse-reclaimed
    // once FASTQC and salmon had both signalled: size kept, bytes zeroed.
    let merged = config.work_dir.join("fastq/sR.fastq");
    let meta = fs::metadata(&merged)?;
    assert!(meta.len() > 0, "reported size must survive reclaim");
    let content = fs::read(&merged)?;
    assert!(
        content.iter().all(|b| *b == 0),
        "reclaimed FASTQ must read as zeros"
    );
    Ok(())
}

#[tokio::test]
async fn test_hisat2_branch_reclaims_bam() -> Result<()> {
    let tmp = TempDir::new()?;
    let sheet = write_local_inputs(tmp.path(), &["s1"]);
    let config = make_config(QuantTool::Hisat2, tmp.path(), |args| {
        args.hisat2 = true;
        args.sample_sheet = Some(sheet.to_string_lossy().to_string());
    });

    quantify::run(Arc::clone(&config)).await?;

    let counts = config.out_dir.join("s1/s1.counts.txt");
    assert!(counts.exists(), "featureCounts output missing");
    assert!(fs::metadata(&counts)?.len() > 0);

    // featureCounts was the BAM's only consumer; afterwards the BAM is a
    // sparse hole with its size intact.
    let bam = config.out_dir.join("s1/s1.bam");
    let meta = fs::metadata(&bam)?;
    assert!(meta.len() > 0);
    let content = fs::read(&bam)?;
    assert!(content.iter().all(|b| *b == 0), "BAM must be reclaimed");
    Ok(())
}

#[tokio::test]
async fn test_publish_flag_retains_bam() -> Result<()> {
    let tmp = TempDir::new()?;
    let sheet = write_local_inputs(tmp.path(), &["s1"]);
    let config = make_config(QuantTool::Hisat2, tmp.path(), |args| {
        args.hisat2 = true;
        args.publish_bam = true;
        args.sample_sheet = Some(sheet.to_string_lossy().to_string());
    });

    quantify::run(Arc::clone(&config)).await?;

    let bam = fs::read(config.out_dir.join("s1/s1.bam"))?;
    assert!(
        bam.starts_with(b"@HD"),
        "published BAM must keep its content"
    );
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_to_postprocess() -> Result<()> {
    let tmp = TempDir::new()?;
    let sheet = write_local_inputs(tmp.path(), &["s1", "s2"]);
    let config = make_config(QuantTool::Kallisto, tmp.path(), |args| {
        args.kallisto = true;
        args.sample_sheet = Some(sheet.to_string_lossy().to_string());
    });

    quantify::run(Arc::clone(&config)).await?;
    fs::remove_file(config.out_dir.join("samples.done.txt"))?;

    // Same configuration again: everything is in done, so the run jumps
    // straight to post-processing without re-admitting anything.
    quantify::run(Arc::clone(&config)).await?;
    assert!(config.out_dir.join("samples.done.txt").exists());
    let queue = SampleQueue::open(&config.work_dir)?;
    assert_eq!(queue.done_count()?, 2);
    assert_eq!(queue.staged_count()?, 0);
    Ok(())
}
