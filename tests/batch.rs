mod common;

use std::fs;
use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;
use varseq_pipelines::cli::menu::confirm_oversubscription;
use varseq_pipelines::config::defs::{PipelineError, RunConfig, BATCH_SUMMARY, VARIANT_STATS_SUFFIX};
use varseq_pipelines::pipelines::aggregate::summarize;
use varseq_pipelines::pipelines::batch::{plan, BatchScheduler, SampleOutcome, Strategy};
use varseq_pipelines::pipelines::variant_calling::{Pipeline, SampleArtifacts};
use varseq_pipelines::utils::reference::{IndexKind, Reference};
use varseq_pipelines::utils::sample::discover;
use varseq_pipelines::utils::vcf::count_variants;

use common::{batch_root, FakeRunner};


fn scheduler_with(runner: Arc<FakeRunner>) -> BatchScheduler {
    BatchScheduler::new(Arc::new(Pipeline::new(runner, Arc::new(RunConfig::default()))))
}

#[tokio::test]
async fn test_one_failure_does_not_touch_siblings() -> Result<()> {
    let root = tempdir()?;
    let fasta = batch_root(root.path(), &["barcode01", "barcode02", "barcode03", "barcode04"])?;
    let samples = discover(root.path(), r"^barcode\d+$")?;
    let reference = Reference::new(&fasta)?;
    let runner = Arc::new(FakeRunner::new().failing("barcode02", "samtools"));

    let approved = plan(samples.len(), 8, Strategy::Balanced)?.approve(false)?;
    let batch = scheduler_with(runner.clone()).execute(samples.clone(), &reference, &approved).await;

    assert_eq!(batch.succeeded, 3);
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.failed_ids, vec!["barcode02".to_string()]);
    assert!(runner.violations.lock().unwrap().is_empty());

    for sample in samples.iter().filter(|s| s.id != "barcode02") {
        let artifacts = SampleArtifacts::for_sample(sample);
        assert_eq!(count_variants(&artifacts.filtered_vcf)?.records, 2);
        assert!(artifacts.variant_stats.is_file());
        let log = fs::read_to_string(sample.batch_log())?;
        assert!(log.contains("succeeded"));
    }

    let failed = &samples[1];
    assert!(!failed.artifact(VARIANT_STATS_SUFFIX).exists());
    let batch_log = fs::read_to_string(failed.batch_log())?;
    assert!(batch_log.contains("FAILED align-to-reference"));
    assert!(batch_log.contains("[tool-exit]"));
    let pipeline_log = fs::read_to_string(failed.pipeline_log())?;
    assert!(pipeline_log.contains("pipeline FAILED at align-to-reference"));

    let report = summarize(&batch, &samples);
    assert_eq!(report.failed_ids, vec!["barcode02".to_string()]);
    report.write(&root.path().join(BATCH_SUMMARY))?;
    let text = fs::read_to_string(root.path().join(BATCH_SUMMARY))?;
    assert!(text.contains("strategy: balanced"));
    assert!(text.contains("failed samples: barcode02"));
    Ok(())
}

#[tokio::test]
async fn test_concurrency_stays_within_allocation() -> Result<()> {
    let root = tempdir()?;
    let ids = ["barcode01", "barcode02", "barcode03", "barcode04", "barcode05"];
    let fasta = batch_root(root.path(), &ids)?;
    let samples = discover(root.path(), r"^barcode\d+$")?;
    let reference = Reference::new(&fasta)?;
    // Indexes up front so every tool call belongs to a sample
    fs::write(reference.index_path(IndexKind::Minimap2), b"mmi")?;
    fs::write(reference.index_path(IndexKind::Faidx), b"fai")?;
    let runner = Arc::new(FakeRunner::new().with_delay(Duration::from_millis(15)));

    let allocation = plan(samples.len(), 64, Strategy::SpeedPriority)?;
    assert_eq!((allocation.max_concurrent_jobs, allocation.threads_per_job), (2, 32));
    let approved = allocation.approve(false)?;
    let batch = scheduler_with(runner.clone()).execute(samples, &reference, &approved).await;

    assert!(batch.all_succeeded());
    assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 2);
    for record in &batch.records {
        assert_eq!(record.job.threads, 32);
        assert_eq!(record.job.strategy, "speed-priority");
        match &record.outcome {
            SampleOutcome::Completed(run) => assert_eq!(run.threads, 32),
            SampleOutcome::Panicked(detail) => panic!("worker panicked: {}", detail),
        }
    }
    let ids_in_order: Vec<&str> = batch.records.iter().map(|r| r.sample.id.as_str()).collect();
    assert_eq!(ids_in_order, ids.to_vec());
    Ok(())
}

#[tokio::test]
async fn test_declined_oversubscription_launches_nothing() -> Result<()> {
    let root = tempdir()?;
    batch_root(root.path(), &["barcode01", "barcode02"])?;
    let samples = discover(root.path(), r"^barcode\d+$")?;

    let allocation = plan(samples.len(), 8, Strategy::custom(2, 8)?)?;
    assert!(allocation.is_oversubscribed());
    let confirmed = confirm_oversubscription(&mut Cursor::new("n\n"), &mut Vec::new(), &allocation)?;
    assert!(!confirmed);
    match allocation.approve(confirmed) {
        Err(PipelineError::Oversubscription { requested, budget }) => assert_eq!((requested, budget), (16, 8)),
        other => panic!("expected oversubscription, got {:?}", other),
    }

    for sample in &samples {
        assert!(!sample.output_dir.exists());
        assert!(!sample.batch_log().exists());
    }
    Ok(())
}

#[tokio::test]
async fn test_sample_without_reads_counts_as_failure() -> Result<()> {
    let root = tempdir()?;
    let fasta = batch_root(root.path(), &["barcode01"])?;
    fs::create_dir(root.path().join("barcode02"))?;
    let samples = discover(root.path(), r"^barcode\d+$")?;
    let reference = Reference::new(&fasta)?;
    let runner = Arc::new(FakeRunner::new());

    let approved = plan(samples.len(), 4, Strategy::MaximumParallelism)?.approve(false)?;
    let batch = scheduler_with(runner.clone()).execute(samples.clone(), &reference, &approved).await;
    assert_eq!(batch.failed_ids, vec!["barcode02".to_string()]);
    assert!(runner.calls_for("barcode02").is_empty());
    let log = fs::read_to_string(samples[1].batch_log())?;
    assert!(log.contains("usage-error"));
    Ok(())
}
