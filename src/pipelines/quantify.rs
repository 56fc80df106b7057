use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::defs::{
    ArtifactClass, PipelineError, QuantTool, RunConfig, FASTERQ_DUMP_TAG, FASTQC_TAG,
    FEATURECOUNTS_TAG, HISAT2_TAG, KALLISTO_TAG, PREFETCH_TAG, SALMON_TAG, SAMTOOLS_TAG,
};
use crate::scheduler::admission::AdvanceOutcome;
use crate::scheduler::join::{BranchPlan, CompletionJoin};
use crate::scheduler::queue::{load_skip_list, Origin, SampleDescriptor, SampleQueue};
use crate::scheduler::reclaim::ReclaimRequest;
use crate::scheduler::resume::{self, ResumeMode};
use crate::scheduler::{watcher, Buses, Scheduler};
use crate::utils::command::{
    self, check_versions, fasterq_dump, fastqc, featurecounts, hisat2, kallisto, prefetch, salmon,
    samtools,
};
use crate::utils::file::{absolutize, concat_files, sample_out_path};

/// Run function for the sample admission + quantification pipeline
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// Result<(), PipelineError>
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    if !config.args.no_version_check {
        let mut tools = vec![FASTQC_TAG, config.tool.tag()];
        if config.tool == QuantTool::Hisat2 {
            tools.push(SAMTOOLS_TAG);
            tools.push(FEATURECOUNTS_TAG);
        }
        if config.args.remote_sheet.is_some() || config.args.series.is_some() {
            tools.push(PREFETCH_TAG);
            tools.push(FASTERQ_DUMP_TAG);
        }
        check_versions(tools).await?;
    }

    let scheduler = Scheduler::new(&config)?;
    let mut buses = Buses::new(config.args.queue_size.max(4));

    // Crash repair before anything else touches the queue.
    let repaired = resume::repair(&scheduler.queue)?;
    if repaired > 0 {
        info!("Repaired queue: {} samples back in staged", repaired);
    }

    // Enumerate and stage. Skip-listed and already-queued samples drop out.
    let skip = load_skip_list(config.args.skip_list.as_deref().map(Path::new))?;
    let descriptors = enumerate(&config).await?;
    let mut staged_new = 0usize;
    for desc in &descriptors {
        if scheduler.queue.write(desc, &skip)? {
            staged_new += 1;
        }
    }
    info!(
        "Enumerated {} samples; {} newly staged",
        descriptors.len(),
        staged_new
    );

    if resume::mode(&scheduler.queue)? == ResumeMode::PostProcessOnly {
        return post_process(&config, &scheduler.queue).await;
    }
    if scheduler.queue.staged_count()? == 0 {
        return Err(PipelineError::InvalidConfig(
            "No samples to process after staging".to_string(),
        ));
    }

    scheduler.admission.seed()?;

    let mut service_tasks: Vec<JoinHandle<()>> = Vec::new();
    let watcher_task = watcher::spawn_watcher(
        scheduler.queue.clone(),
        config.args.watch_interval_ms,
        buses.admitted_tx.clone(),
        buses.shutdown_rx.clone(),
    );
    service_tasks.push(tokio::spawn(async move {
        if let Err(e) = watcher_task.await.map_err(anyhow::Error::from).and_then(|r| r) {
            error!("Watcher failed: {}", e);
        }
    }));
    service_tasks.push(scheduler.spawn_reclaim_executor(buses.reclaim_rx));
    if config.args.join_timeout_secs > 0 {
        service_tasks.push(scheduler.spawn_join_watchdog(
            Duration::from_secs(config.args.join_timeout_secs),
            buses.fatal_tx.clone(),
            buses.shutdown_rx.clone(),
        ));
    }

    let mut sample_tasks: Vec<JoinHandle<()>> = Vec::new();
    let run_result = drive(
        &config,
        &scheduler,
        &mut buses.admitted_rx,
        &mut buses.completion_rx,
        &mut buses.fatal_rx,
        buses.completion_tx.clone(),
        buses.reclaim_tx.clone(),
        buses.fatal_tx.clone(),
        &mut sample_tasks,
    )
    .await;

    // Stop the watcher and watchdog whether we drained or aborted, then
    // let in-flight work settle before post-processing or unwinding.
    let _ = buses.shutdown_tx.send(true);
    drop(buses.admitted_tx);
    drop(buses.reclaim_tx);
    drop(buses.completion_tx);
    drop(buses.fatal_tx);
    if run_result.is_err() {
        for task in &sample_tasks {
            task.abort();
        }
    }
    join_all(sample_tasks).await;
    join_all(service_tasks).await;
    run_result?;

    post_process(&config, &scheduler.queue).await
}

/// The admission loop: routes admitted samples into branch tasks, feeds
/// completions back through advance(), and stops on the terminal state
/// or the first fatal error.
#[allow(clippy::too_many_arguments)]
async fn drive(
    config: &Arc<RunConfig>,
    scheduler: &Scheduler,
    admitted_rx: &mut mpsc::Receiver<SampleDescriptor>,
    completion_rx: &mut mpsc::Receiver<String>,
    fatal_rx: &mut mpsc::Receiver<PipelineError>,
    completion_tx: mpsc::Sender<String>,
    reclaim_tx: mpsc::Sender<ReclaimRequest>,
    fatal_tx: mpsc::Sender<PipelineError>,
    sample_tasks: &mut Vec<JoinHandle<()>>,
) -> Result<(), PipelineError> {
    loop {
        tokio::select! {
            Some(desc) = admitted_rx.recv() => {
                let task = route(
                    Arc::clone(config),
                    desc,
                    scheduler.plan,
                    Arc::clone(&scheduler.join),
                    completion_tx.clone(),
                    reclaim_tx.clone(),
                    fatal_tx.clone(),
                );
                sample_tasks.push(task);
            }
            Some(completed_id) = completion_rx.recv() => {
                match scheduler.admission.advance(&completed_id).await? {
                    AdvanceOutcome::Admitted(desc) => {
                        debug!("Slot freed by {}; {} admitted", completed_id, desc.sample_id);
                    }
                    AdvanceOutcome::Drained => {
                        debug!("Staged empty; waiting on in-flight samples");
                    }
                    AdvanceOutcome::Terminal => {
                        info!("All samples complete");
                        return Ok(());
                    }
                }
            }
            Some(fatal) = fatal_rx.recv() => {
                error!("Fatal: {}", fatal);
                return Err(fatal);
            }
        }
    }
}

/// Dispatches one admitted sample onto the selected branch. Exactly one
/// branch receives it; the task owns the sample until its terminal signal.
fn route(
    config: Arc<RunConfig>,
    desc: SampleDescriptor,
    plan: BranchPlan,
    join: Arc<CompletionJoin>,
    completion_tx: mpsc::Sender<String>,
    reclaim_tx: mpsc::Sender<ReclaimRequest>,
    fatal_tx: mpsc::Sender<PipelineError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sample_id = desc.sample_id.clone();
        let result = match config.tool {
            QuantTool::Hisat2 => {
                process_sample(&config, &desc, plan, &join, &reclaim_tx, hisat2_branch).await
            }
            QuantTool::Kallisto => {
                process_sample(&config, &desc, plan, &join, &reclaim_tx, kallisto_branch).await
            }
            QuantTool::Salmon => {
                process_sample(&config, &desc, plan, &join, &reclaim_tx, salmon_branch).await
            }
        };
        match result {
            Ok(()) => {
                if join.signal(&sample_id, ArtifactClass::Sample, plan.expected(ArtifactClass::Sample)) {
                    if completion_tx.send(sample_id).await.is_err() {
                        warn!("Completion bus closed before sample could report");
                    }
                }
            }
            Err(e) => {
                let _ = fatal_tx.send(e).await;
            }
        }
    })
}

type BranchFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<(), PipelineError>> + Send>,
>;

/// Shared per-sample scaffolding: raw-data preparation, the 2-way
/// metadata/data rendezvous, the FASTQC consumer, then the branch body,
/// then FASTQ reclamation once both consumers have signalled.
async fn process_sample(
    config: &Arc<RunConfig>,
    desc: &SampleDescriptor,
    plan: BranchPlan,
    join: &Arc<CompletionJoin>,
    reclaim_tx: &mpsc::Sender<ReclaimRequest>,
    branch: fn(Arc<RunConfig>, String, PathBuf, PathBuf) -> BranchFuture,
) -> Result<(), PipelineError> {
    let sample_id = desc.sample_id.clone();
    let sample_out = config.out_dir.join(&sample_id);
    tokio::fs::create_dir_all(&sample_out).await?;

    // Metadata marker: one half of the rendezvous, sent as routing begins.
    let rendezvous_expected = plan.expected(ArtifactClass::Rendezvous);
    let marker_join = Arc::clone(join);
    let marker_id = sample_id.clone();
    let marker_task = tokio::spawn(async move {
        marker_join.signal(&marker_id, ArtifactClass::Rendezvous, rendezvous_expected)
    });

    // Raw data: downloaded and merged for remote samples, localized for
    // local ones. The other half of the rendezvous.
    let fastq = prepare_raw_data(config, desc).await?;
    let data_fired = join.signal(&sample_id, ArtifactClass::Rendezvous, rendezvous_expected);
    let marker_fired = marker_task
        .await
        .map_err(|e| PipelineError::Other(anyhow!("Rendezvous marker task: {}", e)))?;
    if !(data_fired || marker_fired) {
        return Err(PipelineError::QueueState(format!(
            "Rendezvous for {} did not complete",
            sample_id
        )));
    }

    // FASTQC and the quantifier both consume the FASTQ; either may finish
    // last and trigger its reclaim.
    let fastq_expected = plan.expected(ArtifactClass::Fastq);
    let qc_config = Arc::clone(config);
    let qc_join = Arc::clone(join);
    let qc_reclaim = reclaim_tx.clone();
    let qc_id = sample_id.clone();
    let qc_fastq = fastq.clone();
    let qc_out = sample_out.clone();
    let qc_task: JoinHandle<Result<(), PipelineError>> = tokio::spawn(async move {
        let args = fastqc::arg_generator(&qc_out, &qc_fastq, qc_config.threads);
        let report = qc_out.join(fastqc_report_name(&qc_fastq));
        command::run_stage(FASTQC_TAG, &args, Some(&report), qc_config.args.verbose).await?;
        signal_artifact(
            &qc_join,
            &qc_reclaim,
            &qc_id,
            ArtifactClass::Fastq,
            fastq_expected,
            &qc_fastq,
            &qc_config,
        )
        .await;
        Ok(())
    });

    let branch_result = branch(
        Arc::clone(config),
        sample_id.clone(),
        fastq.clone(),
        sample_out.clone(),
    )
    .await;

    // The quantifier's FASTQ consumption signal, fired even when the
    // branch cached its outputs, so the refcount always closes.
    if branch_result.is_ok() {
        signal_artifact(
            join,
            reclaim_tx,
            &sample_id,
            ArtifactClass::Fastq,
            fastq_expected,
            &fastq,
            config,
        )
        .await;
    }

    let qc_result = qc_task
        .await
        .map_err(|e| PipelineError::Other(anyhow!("FASTQC task: {}", e)))?;
    branch_result?;
    qc_result?;

    // hisat2 branch: close the BAM refcount opened by featureCounts.
    if config.tool == QuantTool::Hisat2 {
        let bam = sample_out_path(&sample_out, &sample_id, "bam");
        signal_artifact(
            join,
            reclaim_tx,
            &sample_id,
            ArtifactClass::Bam,
            plan.expected(ArtifactClass::Bam),
            &bam,
            config,
        )
        .await;
    }

    Ok(())
}

/// Signals one consumer-done for the artifact; when that closes the
/// refcount, requests reclamation. Inputs outside the working area are
/// user files and never reclaimed.
async fn signal_artifact(
    join: &Arc<CompletionJoin>,
    reclaim_tx: &mpsc::Sender<ReclaimRequest>,
    sample_id: &str,
    class: ArtifactClass,
    expected: u32,
    path: &Path,
    config: &Arc<RunConfig>,
) {
    if !join.signal(sample_id, class, expected) {
        return;
    }
    if !path.starts_with(&config.work_dir) && !path.starts_with(&config.out_dir) {
        debug!(
            "Not reclaiming {} for {}: outside the working area",
            path.display(),
            sample_id
        );
        return;
    }
    let req = ReclaimRequest {
        sample_id: sample_id.to_string(),
        class,
        path: path.to_path_buf(),
    };
    if reclaim_tx.send(req).await.is_err() {
        warn!("Reclaim bus closed; {} not reclaimed", path.display());
    }
}

fn fastqc_report_name(fastq: &Path) -> String {
    let stem = fastq
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sample".to_string());
    format!("{}_fastqc.html", stem)
}

/// Materializes the per-sample FASTQ under `<workdir>/fastq`. Remote
/// samples are fetched run by run and concatenated; local multi-file
/// samples are merged; a single local file is used in place.
async fn prepare_raw_data(
    config: &Arc<RunConfig>,
    desc: &SampleDescriptor,
) -> Result<PathBuf, PipelineError> {
    let fastq_dir = config.work_dir.join("fastq");
    tokio::fs::create_dir_all(&fastq_dir).await?;
    let merged = sample_out_path(&fastq_dir, &desc.sample_id, "fastq");

    match desc.origin {
        Origin::Remote => {
            if crate::utils::file::is_nonempty(&merged) {
                info!("FASTQ for {} present; skipping download", desc.sample_id);
                return Ok(merged);
            }
            let sra_dir = config.work_dir.join("sra");
            tokio::fs::create_dir_all(&sra_dir).await?;
            let mut run_fastqs = Vec::new();
            for run_id in desc.run_ids() {
                let run_fastq = sample_out_path(&fastq_dir, &run_id, "fastq");
                command::run_stage(
                    PREFETCH_TAG,
                    &prefetch::arg_generator(&run_id, &sra_dir),
                    None,
                    config.args.verbose,
                )
                .await?;
                command::run_stage(
                    FASTERQ_DUMP_TAG,
                    &fasterq_dump::arg_generator(&run_id, &fastq_dir, config.threads),
                    Some(&run_fastq),
                    config.args.verbose,
                )
                .await?;
                run_fastqs.push(run_fastq);
            }
            merge_runs(run_fastqs, &merged).await?;
            Ok(merged)
        }
        Origin::Local => {
            let paths: Vec<PathBuf> = desc
                .local_paths()
                .iter()
                .map(|p| absolutize(&p.to_string_lossy(), &config.cwd))
                .collect();
            match paths.len() {
                0 => Err(PipelineError::QueueState(format!(
                    "Local sample {} has no files",
                    desc.sample_id
                ))),
                1 => Ok(paths.into_iter().next().unwrap_or_default()),
                _ => {
                    if !crate::utils::file::is_nonempty(&merged) {
                        merge_runs(paths, &merged).await?;
                    }
                    Ok(merged)
                }
            }
        }
    }
}

async fn merge_runs(inputs: Vec<PathBuf>, output: &Path) -> Result<(), PipelineError> {
    if inputs.len() == 1 {
        let only = inputs.into_iter().next().unwrap_or_default();
        if only != output {
            tokio::fs::rename(&only, output).await?;
        }
        return Ok(());
    }
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || concat_files(&inputs, &output))
        .await
        .map_err(|e| PipelineError::Other(anyhow!("Merge task panicked: {}", e)))??;
    Ok(())
}

fn hisat2_branch(
    config: Arc<RunConfig>,
    sample_id: String,
    fastq: PathBuf,
    sample_out: PathBuf,
) -> BranchFuture {
    Box::pin(async move {
        let index = config.args.index.clone().unwrap_or_default();
        let gtf = config.args.gtf.clone().unwrap_or_default();
        let bam = sample_out_path(&sample_out, &sample_id, "bam");
        command::run_piped_stage(
            HISAT2_TAG,
            &hisat2::arg_generator(&index, &fastq, config.threads),
            SAMTOOLS_TAG,
            &samtools::sort_arg_generator(&bam, config.threads),
            Some(&bam),
        )
        .await?;
        let counts = sample_out_path(&sample_out, &sample_id, "counts.txt");
        command::run_stage(
            FEATURECOUNTS_TAG,
            &featurecounts::arg_generator(&gtf, &bam, &counts, config.threads),
            Some(&counts),
            config.args.verbose,
        )
        .await?;
        Ok(())
    })
}

fn kallisto_branch(
    config: Arc<RunConfig>,
    sample_id: String,
    fastq: PathBuf,
    sample_out: PathBuf,
) -> BranchFuture {
    Box::pin(async move {
        let index = config.args.index.clone().unwrap_or_default();
        let quant_dir = sample_out.join("kallisto");
        tokio::fs::create_dir_all(&quant_dir).await?;
        let abundance = quant_dir.join("abundance.tsv");
        debug!("kallisto quant for {}", sample_id);
        command::run_stage(
            KALLISTO_TAG,
            &kallisto::arg_generator(&index, &quant_dir, &fastq, config.threads),
            Some(&abundance),
            config.args.verbose,
        )
        .await?;
        Ok(())
    })
}

fn salmon_branch(
    config: Arc<RunConfig>,
    sample_id: String,
    fastq: PathBuf,
    sample_out: PathBuf,
) -> BranchFuture {
    Box::pin(async move {
        let index = config.args.index.clone().unwrap_or_default();
        let quant_dir = sample_out.join("salmon");
        tokio::fs::create_dir_all(&quant_dir).await?;
        let quant_sf = quant_dir.join("quant.sf");
        debug!("salmon quant for {}", sample_id);
        command::run_stage(
            SALMON_TAG,
            &salmon::arg_generator(&index, &quant_dir, &fastq, config.threads),
            Some(&quant_sf),
            config.args.verbose,
        )
        .await?;
        Ok(())
    })
}

/// Enumerates sample descriptors from the local sheet, the pre-resolved
/// remote sheet, and (when given) a series accession resolved through
/// the external metadata tool.
async fn enumerate(config: &Arc<RunConfig>) -> Result<Vec<SampleDescriptor>, PipelineError> {
    let mut descriptors = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    if let Some(sheet) = &config.args.sample_sheet {
        let path = absolutize(sheet, &config.cwd);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PipelineError::InvalidConfig(format!("Cannot read sample sheet {}: {}", path.display(), e))
        })?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (id, files) = line.split_once('\t').ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "Sample sheet line {}: expected sample_id<TAB>files",
                    lineno + 1
                ))
            })?;
            let paths: Vec<PathBuf> = files
                .split(';')
                .filter(|f| !f.is_empty())
                .map(PathBuf::from)
                .collect();
            push_unique(
                &mut descriptors,
                &mut seen,
                SampleDescriptor::local(id.trim().to_string(), paths),
            )?;
        }
    }

    if let Some(sheet) = &config.args.remote_sheet {
        let path = absolutize(sheet, &config.cwd);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PipelineError::InvalidConfig(format!("Cannot read remote sheet {}: {}", path.display(), e))
        })?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (id, runs) = line.split_once('\t').ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "Remote sheet line {}: expected sample_id<TAB>runs",
                    lineno + 1
                ))
            })?;
            let runs: Vec<String> = runs.split_whitespace().map(|s| s.to_string()).collect();
            push_unique(
                &mut descriptors,
                &mut seen,
                SampleDescriptor::remote(id.trim().to_string(), runs),
            )?;
        }
    }

    if let Some(series) = &config.args.series {
        for (id, runs) in command::pysradb::resolve_series(series).await? {
            push_unique(
                &mut descriptors,
                &mut seen,
                SampleDescriptor::remote(id, runs),
            )?;
        }
    }

    Ok(descriptors)
}

fn push_unique(
    descriptors: &mut Vec<SampleDescriptor>,
    seen: &mut HashSet<String>,
    desc: SampleDescriptor,
) -> Result<(), PipelineError> {
    if desc.sample_id.is_empty() {
        return Err(PipelineError::InvalidConfig(
            "Empty sample_id in input sheet".to_string(),
        ));
    }
    if !seen.insert(desc.sample_id.clone()) {
        return Err(PipelineError::InvalidConfig(format!(
            "Duplicate sample_id across inputs: {}",
            desc.sample_id
        )));
    }
    descriptors.push(desc);
    Ok(())
}

/// Aggregate post-processing once no staged or admitted samples remain:
/// a manifest of finished samples, then the external matrix-assembly and
/// report collaborators.
async fn post_process(config: &Arc<RunConfig>, queue: &SampleQueue) -> Result<(), PipelineError> {
    let done = queue
        .list_names(&queue.done_dir())
        .map_err(|e| PipelineError::QueueState(e.to_string()))?;
    let manifest = config.out_dir.join("samples.done.txt");
    let mut lines: Vec<String> = done
        .iter()
        .map(|name| name.trim_end_matches(".sample").to_string())
        .collect();
    lines.sort();
    tokio::fs::write(&manifest, format!("{}\n", lines.join("\n"))).await?;
    info!("Wrote completion manifest for {} samples", lines.len());

    let mut formats = Vec::new();
    if config.args.counts {
        formats.push("counts");
    }
    if config.args.tpm {
        formats.push("tpm");
    }

    if let Some(cmd) = &config.args.matrix_cmd {
        run_collaborator(cmd, config, &formats).await?;
    }
    if let Some(cmd) = &config.args.report_cmd {
        run_collaborator(cmd, config, &[]).await?;
    }
    println!("Post-processing complete: {} samples finished.", lines.len());
    Ok(())
}

async fn run_collaborator(
    cmd: &str,
    config: &Arc<RunConfig>,
    formats: &[&str],
) -> Result<(), PipelineError> {
    let mut parts = cmd.split_whitespace();
    let program = parts.next().ok_or_else(|| {
        PipelineError::InvalidConfig("Empty post-processing command".to_string())
    })?;
    let mut args: Vec<String> = parts.map(|s| s.to_string()).collect();
    args.push(config.out_dir.to_string_lossy().to_string());
    for f in formats {
        args.push(format!("--{}", f));
    }
    command::run_stage(program, &args, None, config.args.verbose).await?;
    Ok(())
}
