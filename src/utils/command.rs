/// Functions and structs for building and running external tool invocations

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use log::{debug, info};
use tokio::process::Command;

use crate::config::defs::{PipelineError, FEATURECOUNTS_TAG, TOOL_VERSIONS};
use crate::utils::file::is_nonempty;

pub mod prefetch {
    use std::path::Path;

    pub fn arg_generator(run_id: &str, sra_dir: &Path) -> Vec<String> {
        vec![
            run_id.to_string(),
            "-O".to_string(),
            sra_dir.to_string_lossy().to_string(),
        ]
    }
}

pub mod fasterq_dump {
    use std::path::Path;

    pub fn arg_generator(run_id: &str, fastq_dir: &Path, threads: usize) -> Vec<String> {
        vec![
            "--concatenate-reads".to_string(),
            "-O".to_string(),
            fastq_dir.to_string_lossy().to_string(),
            "-e".to_string(),
            threads.to_string(),
            run_id.to_string(),
        ]
    }
}

pub mod fastqc {
    use std::path::Path;

    pub fn arg_generator(out_dir: &Path, fastq: &Path, threads: usize) -> Vec<String> {
        vec![
            "-o".to_string(),
            out_dir.to_string_lossy().to_string(),
            "-t".to_string(),
            threads.to_string(),
            fastq.to_string_lossy().to_string(),
        ]
    }
}

pub mod hisat2 {
    use std::path::Path;

    /// SAM goes to stdout; the caller pipes it into samtools sort.
    pub fn arg_generator(index: &str, fastq: &Path, threads: usize) -> Vec<String> {
        vec![
            "-x".to_string(),
            index.to_string(),
            "-U".to_string(),
            fastq.to_string_lossy().to_string(),
            "-p".to_string(),
            threads.to_string(),
            "--no-unal".to_string(),
        ]
    }
}

pub mod samtools {
    use std::path::Path;

    pub fn sort_arg_generator(out_bam: &Path, threads: usize) -> Vec<String> {
        vec![
            "sort".to_string(),
            "-@".to_string(),
            threads.to_string(),
            "-O".to_string(),
            "bam".to_string(),
            "-o".to_string(),
            out_bam.to_string_lossy().to_string(),
            "-".to_string(),
        ]
    }
}

pub mod featurecounts {
    use std::path::Path;

    pub fn arg_generator(gtf: &str, bam: &Path, out_counts: &Path, threads: usize) -> Vec<String> {
        vec![
            "-a".to_string(),
            gtf.to_string(),
            "-o".to_string(),
            out_counts.to_string_lossy().to_string(),
            "-T".to_string(),
            threads.to_string(),
            bam.to_string_lossy().to_string(),
        ]
    }
}

pub mod kallisto {
    use std::path::Path;

    pub fn arg_generator(index: &str, out_dir: &Path, fastq: &Path, threads: usize) -> Vec<String> {
        vec![
            "quant".to_string(),
            "-i".to_string(),
            index.to_string(),
            "-o".to_string(),
            out_dir.to_string_lossy().to_string(),
            "--single".to_string(),
            "-l".to_string(),
            "200".to_string(),
            "-s".to_string(),
            "20".to_string(),
            "-t".to_string(),
            threads.to_string(),
            fastq.to_string_lossy().to_string(),
        ]
    }
}

pub mod salmon {
    use std::path::Path;

    pub fn arg_generator(index: &str, out_dir: &Path, fastq: &Path, threads: usize) -> Vec<String> {
        vec![
            "quant".to_string(),
            "-i".to_string(),
            index.to_string(),
            "-l".to_string(),
            "A".to_string(),
            "-r".to_string(),
            fastq.to_string_lossy().to_string(),
            "-o".to_string(),
            out_dir.to_string_lossy().to_string(),
            "-p".to_string(),
            threads.to_string(),
        ]
    }
}

pub mod pysradb {
    use anyhow::{anyhow, Result};
    use std::collections::BTreeMap;
    use std::process::Stdio;
    use tokio::process::Command;

    use crate::config::defs::PYSRADB_TAG;

    /// Resolves a series accession into per-sample run groupings through
    /// the external metadata tool. Output rows are `sample_id<WS>run_id`;
    /// header and comment lines are skipped.
    pub async fn resolve_series(series: &str) -> Result<Vec<(String, Vec<String>)>> {
        let output = Command::new(PYSRADB_TAG)
            .args(["metadata", series])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is pysradb installed?", PYSRADB_TAG, e))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} metadata {} exited with {}: {}",
                PYSRADB_TAG,
                series,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.to_lowercase().starts_with("sample")
            {
                continue;
            }
            let mut cols = line.split_whitespace();
            match (cols.next(), cols.next()) {
                (Some(sample), Some(run)) => {
                    groups.entry(sample.to_string()).or_default().push(run.to_string());
                }
                _ => return Err(anyhow!("Unparseable metadata row: {}", line)),
            }
        }
        if groups.is_empty() {
            return Err(anyhow!("Series {} resolved to zero samples", series));
        }
        Ok(groups.into_iter().collect())
    }
}

fn version_flag(tool: &str) -> &'static str {
    match tool {
        FEATURECOUNTS_TAG => "-v",
        _ => "--version",
    }
}

/// Checks a tool answers its version flag.
///
/// # Arguments
///
/// * `tool` - Executable tag from config::defs.
///
/// # Returns
/// First output line of the version banner.
pub async fn presence_check(tool: &str) -> Result<String> {
    let output = Command::new(tool)
        .arg(version_flag(tool))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", tool, e, tool))?;
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).to_string()
    } else {
        String::from_utf8_lossy(&output.stdout).to_string()
    };
    let first_line = text
        .lines()
        .next()
        .ok_or_else(|| anyhow!("No output from {} {}", tool, version_flag(tool)))?
        .to_string();
    Ok(first_line)
}

pub async fn check_versions(tools: Vec<&str>) -> Result<()> {
    for tool in tools {
        let banner = presence_check(tool).await?;
        debug!("{}: {}", tool, banner);
        if let (Some(min), Some(found)) = (TOOL_VERSIONS.get(tool), parse_version(&banner)) {
            if found < *min {
                log::warn!("{} version {} is older than the tested {}", tool, found, min);
            }
        }
    }
    Ok(())
}

/// First major.minor number in a version banner, if any.
fn parse_version(banner: &str) -> Option<f32> {
    banner
        .split(|c: char| c.is_whitespace() || c == 'v' || c == '-')
        .filter_map(|tok| {
            let numeric: String = tok
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            let mut parts = numeric.split('.');
            let major = parts.next()?.parse::<u32>().ok()?;
            let minor = parts.next().and_then(|m| m.parse::<u32>().ok()).unwrap_or(0);
            format!("{}.{}", major, minor).parse::<f32>().ok()
        })
        .next()
}

/// Whether the stage runner reused an existing output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageOutcome {
    pub cached: bool,
}

/// Runs one black-box stage to completion. When the stage's primary
/// output already exists non-empty, the invocation is skipped; this is
/// the result-cache contract that sparse reclaim preserves.
pub async fn run_stage(
    tool: &str,
    args: &[String],
    primary_output: Option<&Path>,
    verbose: bool,
) -> Result<StageOutcome, PipelineError> {
    if let Some(out) = primary_output {
        if is_nonempty(out) {
            info!("{} output {} present; skipping", tool, out.display());
            return Ok(StageOutcome { cached: true });
        }
    }
    debug!("Running {} {:?}", tool, args);
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(if verbose { Stdio::inherit() } else { Stdio::null() })
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!("spawn failed: {}. Is {} installed?", e, tool),
        })?;
    if !output.status.success() {
        return Err(PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }
    Ok(StageOutcome { cached: false })
}

/// Runs `producer | consumer` with stdout wired to stdin, as one stage.
/// Used for the hisat2 -> samtools sort alignment step.
pub async fn run_piped_stage(
    producer: &str,
    producer_args: &[String],
    consumer: &str,
    consumer_args: &[String],
    primary_output: Option<&Path>,
) -> Result<StageOutcome, PipelineError> {
    if let Some(out) = primary_output {
        if is_nonempty(out) {
            info!(
                "{}|{} output {} present; skipping",
                producer,
                consumer,
                out.display()
            );
            return Ok(StageOutcome { cached: true });
        }
    }
    debug!("Running {} {:?} | {} {:?}", producer, producer_args, consumer, consumer_args);

    let mut producer_child = Command::new(producer)
        .args(producer_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| PipelineError::ToolExecution {
            tool: producer.to_string(),
            error: format!("spawn failed: {}. Is {} installed?", e, producer),
        })?;
    let producer_stdout = producer_child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::ToolExecution {
            tool: producer.to_string(),
            error: "no stdout handle".to_string(),
        })?;

    let mut consumer_child = Command::new(consumer)
        .args(consumer_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| PipelineError::ToolExecution {
            tool: consumer.to_string(),
            error: format!("spawn failed: {}. Is {} installed?", e, consumer),
        })?;
    let mut consumer_stdin = consumer_child
        .stdin
        .take()
        .ok_or_else(|| PipelineError::ToolExecution {
            tool: consumer.to_string(),
            error: "no stdin handle".to_string(),
        })?;

    let copy_task = tokio::spawn(async move {
        let mut producer_stdout = producer_stdout;
        let copied = tokio::io::copy(&mut producer_stdout, &mut consumer_stdin).await?;
        drop(consumer_stdin);
        Ok::<u64, std::io::Error>(copied)
    });

    let producer_status = producer_child.wait().await.map_err(|e| {
        PipelineError::ToolExecution {
            tool: producer.to_string(),
            error: e.to_string(),
        }
    })?;
    let copied = copy_task
        .await
        .map_err(|e| PipelineError::Other(anyhow!("Pipe task panicked: {}", e)))?
        .map_err(|e| PipelineError::ToolExecution {
            tool: producer.to_string(),
            error: format!("pipe copy failed: {}", e),
        })?;
    let consumer_status = consumer_child.wait().await.map_err(|e| {
        PipelineError::ToolExecution {
            tool: consumer.to_string(),
            error: e.to_string(),
        }
    })?;

    if !producer_status.success() {
        return Err(PipelineError::ToolExecution {
            tool: producer.to_string(),
            error: format!("exited with {}", producer_status),
        });
    }
    if !consumer_status.success() {
        return Err(PipelineError::ToolExecution {
            tool: consumer.to_string(),
            error: format!("exited with {}", consumer_status),
        });
    }
    debug!("{} -> {} piped {} bytes", producer, consumer, copied);
    Ok(StageOutcome { cached: false })
}
