mod cli;
mod config;
mod pipelines;
mod scheduler;
mod utils;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use std::{env, fs};

use anyhow::Result;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};

use crate::cli::{parse, Arguments};
use crate::config::defs::{PipelineError, PublishPolicy, QuantTool, RunConfig};
use crate::utils::file::absolutize;
use crate::utils::system::{detect_cores_and_load, stage_threads};
use pipelines::quantify;

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n RNAseq Queue\n-------------\n");

    let cwd = env::current_dir()?;
    info!("The current directory is {:?}\n", cwd);

    let run_config = match build_config(args, cwd, log_level).await {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = quantify::run(run_config).await {
        error!(
            "Pipeline failed: {} at {} milliseconds.",
            e,
            run_start.elapsed().as_millis()
        );
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}

/// Validates the startup surface and assembles RunConfig. Every check in
/// here is fatal before a single sample is admitted.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// * `log_level` - Level chosen from --verbose.
///
/// # Returns
/// RunConfig for the pipeline.
async fn build_config(
    args: Arguments,
    cwd: PathBuf,
    log_level: LevelFilter,
) -> Result<RunConfig, PipelineError> {
    let tool = selected_tool(&args)?;

    if args.index.as_deref().unwrap_or("").is_empty() {
        return Err(PipelineError::InvalidConfig(format!(
            "--index is required for {}",
            tool
        )));
    }
    if tool == QuantTool::Hisat2 && args.gtf.as_deref().unwrap_or("").is_empty() {
        return Err(PipelineError::InvalidConfig(
            "--gtf is required for the hisat2 branch (featureCounts annotation)".to_string(),
        ));
    }
    if args.sample_sheet.is_none() && args.remote_sheet.is_none() && args.series.is_none() {
        return Err(PipelineError::InvalidConfig(
            "No input source: give --samples, --remote, or --series".to_string(),
        ));
    }
    if !args.counts && !args.tpm {
        return Err(PipelineError::InvalidConfig(
            "No output format selected: give --counts and/or --tpm".to_string(),
        ));
    }
    if args.queue_size == 0 {
        return Err(PipelineError::InvalidConfig(
            "--queue-size must be positive".to_string(),
        ));
    }
    if args.lock_retries == 0 {
        return Err(PipelineError::InvalidConfig(
            "--lock-retries must be positive".to_string(),
        ));
    }

    let work_dir = absolutize(args.work_dir.as_deref().unwrap_or("work"), &cwd);
    let out_dir = absolutize(args.out_dir.as_deref().unwrap_or("results"), &cwd);
    fs::create_dir_all(&work_dir)?;
    fs::create_dir_all(&out_dir)?;

    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await?;
    let threads = stage_threads(max_cores, args.queue_size);
    debug!(
        "Detected {} usable cores; CPU load {}%; {} threads per tool invocation",
        max_cores, cpu_load, threads
    );

    let publish = PublishPolicy {
        fastq: args.publish_fastq,
        bam: args.publish_bam,
    };

    Ok(RunConfig {
        cwd,
        work_dir,
        out_dir,
        tool,
        publish,
        threads,
        log_level,
        args,
    })
}

/// Exactly one branch must be selected; zero or several is a fatal
/// configuration error.
fn selected_tool(args: &Arguments) -> Result<QuantTool, PipelineError> {
    let chosen: Vec<QuantTool> = [
        (args.hisat2, QuantTool::Hisat2),
        (args.kallisto, QuantTool::Kallisto),
        (args.salmon, QuantTool::Salmon),
    ]
    .into_iter()
    .filter_map(|(flag, tool)| flag.then_some(tool))
    .collect();

    match chosen.as_slice() {
        [tool] => Ok(*tool),
        [] => Err(PipelineError::InvalidConfig(
            "Select a quantifier: one of --hisat2, --kallisto, --salmon".to_string(),
        )),
        many => Err(PipelineError::InvalidConfig(format!(
            "Select exactly one quantifier; got {}",
            many.iter()
                .map(|t| t.tag())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}
