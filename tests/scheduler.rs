use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

use rnaseq_queue::config::defs::ArtifactClass;
use rnaseq_queue::scheduler::admission::{AdmissionController, AdvanceOutcome};
use rnaseq_queue::scheduler::join::{BranchPlan, CompletionJoin};
use rnaseq_queue::scheduler::lock::QueueLock;
use rnaseq_queue::scheduler::queue::{load_skip_list, SampleDescriptor, SampleQueue};
use rnaseq_queue::scheduler::reclaim::reclaim;
use rnaseq_queue::scheduler::resume::{self, ResumeMode};
use rnaseq_queue::scheduler::watcher::spawn_watcher;
use rnaseq_queue::config::defs::QuantTool;

fn stage_samples(queue: &SampleQueue, ids: &[&str]) -> Result<()> {
    let skip = HashSet::new();
    for id in ids {
        let desc = SampleDescriptor::local(
            id.to_string(),
            vec![Path::new("/data").join(format!("{}.fastq", id))],
        );
        assert!(queue.write(&desc, &skip)?);
    }
    Ok(())
}

fn controller(queue: &SampleQueue, queue_size: usize) -> AdmissionController {
    let lock = QueueLock::new(queue.lock_path(), 10, 100);
    AdmissionController::new(queue.clone(), lock, queue_size)
}

#[tokio::test]
async fn test_seed_counts() -> Result<()> {
    let cases = vec![(0usize, 2usize), (1, 2), (2, 2), (5, 2), (3, 8), (8, 8)];
    for (staged, queue_size) in cases {
        let tmp = TempDir::new()?;
        let queue = SampleQueue::open(tmp.path())?;
        let ids: Vec<String> = (0..staged).map(|i| format!("s{:02}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        stage_samples(&queue, &id_refs)?;

        let admitted = controller(&queue, queue_size).seed()?;
        assert_eq!(admitted, staged.min(queue_size));
        assert_eq!(queue.admitted_count()?, staged.min(queue_size));
        assert_eq!(queue.staged_count()?, staged - staged.min(queue_size));
    }
    Ok(())
}

#[tokio::test]
async fn test_advance_end_to_end() -> Result<()> {
    let tmp = TempDir::new()?;
    let queue = SampleQueue::open(tmp.path())?;
    stage_samples(&queue, &["s1", "s2", "s3"])?;
    let admission = controller(&queue, 2);

    assert_eq!(admission.seed()?, 2);
    assert_eq!(queue.admitted_count()?, 2);
    assert_eq!(queue.staged_count()?, 1);

    // s1 completes: s3 is the lowest (and only) staged record.
    match admission.advance("s1").await? {
        AdvanceOutcome::Admitted(desc) => assert_eq!(desc.sample_id, "s3"),
        other => panic!("Expected admission of s3, got {:?}", other),
    }
    assert_eq!(queue.admitted_count()?, 2);
    assert_eq!(queue.done_count()?, 1);

    // s2 completes: nothing staged, s3 still running.
    assert_eq!(admission.advance("s2").await?, AdvanceOutcome::Drained);
    assert_eq!(queue.admitted_count()?, 1);

    // s3 completes: both locations empty, terminal.
    assert_eq!(admission.advance("s3").await?, AdvanceOutcome::Terminal);
    assert_eq!(queue.admitted_count()?, 0);
    assert_eq!(queue.staged_count()?, 0);
    assert_eq!(queue.done_count()?, 3);
    Ok(())
}

#[tokio::test]
async fn test_admission_bound_never_exceeded() -> Result<()> {
    let tmp = TempDir::new()?;
    let queue = SampleQueue::open(tmp.path())?;
    let ids: Vec<String> = (0..6).map(|i| format!("s{}", i)).collect();
    let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
    stage_samples(&queue, &id_refs)?;
    let admission = controller(&queue, 2);

    admission.seed()?;
    assert!(queue.admitted_count()? <= 2);
    for id in &ids[..4] {
        admission.advance(id).await?;
        assert!(queue.admitted_count()? <= 2, "bound violated after {}", id);
    }
    Ok(())
}

#[tokio::test]
async fn test_skip_list_excluded_everywhere() -> Result<()> {
    let tmp = TempDir::new()?;
    let queue = SampleQueue::open(tmp.path())?;

    let skip_path = tmp.path().join("skip.txt");
    fs::write(&skip_path, "s_bad\n\ns_other\n")?;
    let skip = load_skip_list(Some(&skip_path))?;
    assert_eq!(skip.len(), 2);

    let dropped = SampleDescriptor::local("s_bad".to_string(), vec!["/data/x.fastq".into()]);
    let kept = SampleDescriptor::local("s_ok".to_string(), vec!["/data/y.fastq".into()]);
    assert!(!queue.write(&dropped, &skip)?);
    assert!(queue.write(&kept, &skip)?);

    controller(&queue, 4).seed()?;
    assert_eq!(queue.location_of("s_bad"), None);
    assert_eq!(queue.location_of("s_ok"), Some("admitted"));
    Ok(())
}

#[tokio::test]
async fn test_write_refuses_requeue() -> Result<()> {
    let tmp = TempDir::new()?;
    let queue = SampleQueue::open(tmp.path())?;
    let skip = HashSet::new();
    let desc = SampleDescriptor::local("s1".to_string(), vec!["/data/a.fastq".into()]);
    assert!(queue.write(&desc, &skip)?);
    // Same id again, staged: dropped.
    assert!(!queue.write(&desc, &skip)?);
    // Finished: still dropped on re-enumeration.
    controller(&queue, 1).seed()?;
    controller(&queue, 1).advance("s1").await?;
    assert_eq!(queue.location_of("s1"), Some("done"));
    assert!(!queue.write(&desc, &skip)?);
    assert_eq!(queue.staged_count()?, 0);
    Ok(())
}

#[test]
fn test_descriptor_record_roundtrip() -> Result<()> {
    let multi = SampleDescriptor::local(
        "gsm1".to_string(),
        vec!["/d/r1.fastq".into(), "/d/r2.fastq".into()],
    );
    let line = multi.to_record();
    assert_eq!(line, "\"gsm1\",\"/d/r1.fastq::/d/r2.fastq\",\"local\"");
    let parsed = SampleDescriptor::from_record(&line)?;
    assert_eq!(parsed, multi);
    assert_eq!(parsed.local_paths().len(), 2);

    let remote = SampleDescriptor::remote("gsm2".to_string(), vec!["SRR1".into(), "SRR2".into()]);
    let parsed = SampleDescriptor::from_record(&remote.to_record())?;
    assert_eq!(parsed.run_ids(), vec!["SRR1", "SRR2"]);
    Ok(())
}

#[test]
fn test_refcount_fires_exactly_at_expected() {
    let join = CompletionJoin::new();
    assert!(!join.signal("s1", ArtifactClass::Fastq, 3));
    assert!(!join.signal("s1", ArtifactClass::Fastq, 3));
    assert!(join.signal("s1", ArtifactClass::Fastq, 3));
    // Counter discarded after firing; a fresh key starts over.
    assert!(!join.signal("s1", ArtifactClass::Fastq, 3));
    assert!(!join.is_idle());
}

#[test]
fn test_refcount_keys_independent() {
    let join = CompletionJoin::new();
    assert!(!join.signal("s1", ArtifactClass::Fastq, 2));
    assert!(!join.signal("s2", ArtifactClass::Fastq, 2));
    assert!(join.signal("s2", ArtifactClass::Fastq, 2));
    assert!(join.signal("s1", ArtifactClass::Fastq, 2));
    // Same sample, different class: separate counter.
    assert!(join.signal("s1", ArtifactClass::Bam, 1));
}

#[tokio::test]
async fn test_refcount_concurrent_single_fire() -> Result<()> {
    let join = Arc::new(CompletionJoin::new());
    let expected = 64u32;
    let mut handles = Vec::new();
    for _ in 0..expected {
        let join = Arc::clone(&join);
        handles.push(tokio::spawn(async move {
            join.signal("s1", ArtifactClass::Fastq, expected)
        }));
    }
    let mut fired = 0;
    for h in handles {
        if h.await? {
            fired += 1;
        }
    }
    assert_eq!(fired, 1, "exactly one signal closes the refcount");
    assert!(join.is_idle());
    Ok(())
}

#[test]
fn test_branch_plan_expected_counts() {
    for tool in [QuantTool::Hisat2, QuantTool::Kallisto, QuantTool::Salmon] {
        let plan = BranchPlan::new(tool);
        assert_eq!(plan.expected(ArtifactClass::Fastq), 2);
        assert_eq!(plan.expected(ArtifactClass::Sample), 1);
        assert_eq!(plan.expected(ArtifactClass::Rendezvous), 2);
        let bam = plan.expected(ArtifactClass::Bam);
        if tool == QuantTool::Hisat2 {
            assert_eq!(bam, 1);
        } else {
            assert_eq!(bam, 0);
        }
    }
}

#[test]
fn test_rendezvous_order_independent() {
    // Metadata marker first.
    let join = CompletionJoin::new();
    assert!(!join.signal("s1", ArtifactClass::Rendezvous, 2));
    assert!(join.signal("s1", ArtifactClass::Rendezvous, 2));
    // Raw-data-ready first: same outcome.
    let join = CompletionJoin::new();
    assert!(!join.signal("s2", ArtifactClass::Rendezvous, 2));
    assert!(join.signal("s2", ArtifactClass::Rendezvous, 2));
}

#[test]
fn test_sparse_reclaim_roundtrip() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("sample.fastq");
    let payload = vec![b'A'; 1 << 16];
    fs::write(&path, &payload)?;

    let before = fs::metadata(&path)?;
    let mtime_before = filetime::FileTime::from_last_modification_time(&before);

    reclaim(&path)?;

    let after = fs::metadata(&path)?;
    assert_eq!(after.len(), payload.len() as u64, "reported size preserved");
    let mtime_after = filetime::FileTime::from_last_modification_time(&after);
    assert_eq!(mtime_before, mtime_after, "mtime preserved");

    let content = fs::read(&path)?;
    assert_eq!(content.len(), payload.len());
    assert!(content.iter().all(|b| *b == 0), "content reads as zeros");
    Ok(())
}

#[tokio::test]
async fn test_lock_mutual_exclusion() -> Result<()> {
    let tmp = TempDir::new()?;
    let lock_path = tmp.path().join("queue.lock");
    let a = QueueLock::new(lock_path.clone(), 5, 3);
    let b = QueueLock::new(lock_path, 5, 3);

    let guard = a.try_acquire()?.expect("first holder");
    assert!(b.try_acquire()?.is_none(), "second holder must be refused");
    drop(guard);
    assert!(b.try_acquire()?.is_some(), "released lock is acquirable");
    Ok(())
}

#[tokio::test]
async fn test_lock_retry_cap_is_fatal() -> Result<()> {
    let tmp = TempDir::new()?;
    let lock_path = tmp.path().join("queue.lock");
    let holder = QueueLock::new(lock_path.clone(), 1, 2);
    let waiter = QueueLock::new(lock_path, 1, 3);

    let _guard = holder.try_acquire()?.expect("holder");
    let err = waiter.acquire().await.err().expect("cap must trip");
    let msg = err.to_string();
    assert!(msg.contains("Could not obtain queue lock"), "got: {}", msg);
    Ok(())
}

#[tokio::test]
async fn test_resume_repair_and_postprocess_mode() -> Result<()> {
    let tmp = TempDir::new()?;
    let queue = SampleQueue::open(tmp.path())?;
    let skip = HashSet::new();

    // Prior run: A, B, C all done.
    for id in ["sA", "sB", "sC"] {
        let desc = SampleDescriptor::local(id.to_string(), vec!["/d/x.fastq".into()]);
        queue.write(&desc, &skip)?;
    }
    let admission = controller(&queue, 3);
    admission.seed()?;
    for id in ["sA", "sB", "sC"] {
        admission.advance(id).await?;
    }

    assert_eq!(resume::repair(&queue)?, 0);
    assert_eq!(resume::mode(&queue)?, ResumeMode::PostProcessOnly);
    Ok(())
}

#[tokio::test]
async fn test_resume_unadmits_lingering_samples() -> Result<()> {
    let tmp = TempDir::new()?;
    let queue = SampleQueue::open(tmp.path())?;
    stage_samples(&queue, &["s1", "s2", "s3"])?;
    controller(&queue, 2).seed()?;
    assert_eq!(queue.admitted_count()?, 2);

    // Crash. Restart repairs admitted back into staged.
    assert_eq!(resume::repair(&queue)?, 2);
    assert_eq!(queue.admitted_count()?, 0);
    assert_eq!(queue.staged_count()?, 3);
    assert_eq!(resume::mode(&queue)?, ResumeMode::Normal);
    Ok(())
}

#[tokio::test]
async fn test_watcher_emits_exactly_once() -> Result<()> {
    let tmp = TempDir::new()?;
    let queue = SampleQueue::open(tmp.path())?;
    stage_samples(&queue, &["s1", "s2", "s3", "s4"])?;
    let admission = controller(&queue, 2);
    admission.seed()?;
    // s0_done predates this run and must never be emitted.
    let skip = HashSet::new();
    let done = SampleDescriptor::local("s0_done".to_string(), vec!["/d/z.fastq".into()]);
    queue.write(&done, &skip)?;
    queue.transition("s0_done", "staged", "done")?;

    let (admitted_tx, mut admitted_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = spawn_watcher(queue.clone(), 20, admitted_tx, shutdown_rx);

    let first = admitted_rx.recv().await.expect("first admitted sample");
    let second = admitted_rx.recv().await.expect("second admitted sample");
    let mut seen = vec![first.sample_id, second.sample_id];
    seen.sort();
    assert_eq!(seen, vec!["s1", "s2"]);

    // A completion admits s3; the watcher picks up only the new record.
    admission.advance("s1").await?;
    let third = admitted_rx.recv().await.expect("third admitted sample");
    assert_eq!(third.sample_id, "s3");

    // No re-emits pending.
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(120), admitted_rx.recv())
            .await
            .is_err(),
        "watcher must not re-emit"
    );

    shutdown_tx.send(true)?;
    watcher.await??;
    Ok(())
}
