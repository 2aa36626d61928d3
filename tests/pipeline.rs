mod common;

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use tempfile::tempdir;
use varseq_pipelines::config::defs::{PipelineError, RunConfig};
use varseq_pipelines::pipelines::stage::{ReasonCode, StageName, StageStatus};
use varseq_pipelines::pipelines::variant_calling::{Pipeline, RunStatus, SampleArtifacts, VariantStatsReport};
use varseq_pipelines::utils::file::is_non_empty_file;
use varseq_pipelines::utils::reference::{IndexKind, Reference};
use varseq_pipelines::utils::sample::Sample;

use common::{batch_root, FakeRunner};


fn pipeline_with(runner: Arc<FakeRunner>) -> Pipeline {
    Pipeline::new(runner, Arc::new(RunConfig::default()))
}

#[tokio::test]
async fn test_full_run_produces_every_artifact() -> Result<()> {
    let root = tempdir()?;
    let fasta = batch_root(root.path(), &["barcode01"])?;
    let sample = Sample::from_dir(&root.path().join("barcode01"))?;
    let reference = Reference::new(&fasta)?;
    let runner = Arc::new(FakeRunner::new());

    let run = pipeline_with(runner.clone()).run(&sample, &reference, 8).await;
    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.failure());
    let names: Vec<StageName> = run.stages.iter().map(|r| r.stage).collect();
    assert_eq!(names, StageName::ORDER.to_vec());
    assert!(run.stages.iter().all(|r| r.status == StageStatus::Succeeded));

    assert_eq!(
        runner.tools(),
        vec![
            "fastp", "minimap2", "minimap2", "samtools", "samtools", "samtools", "samtools", "run_clair3.sh",
            "bcftools", "bcftools",
        ]
    );
    assert!(runner.violations.lock().unwrap().is_empty());
    assert!(reference.has_index(IndexKind::Minimap2));
    assert!(reference.has_index(IndexKind::Faidx));

    let artifacts = SampleArtifacts::for_sample(&sample);
    for path in [
        &artifacts.combined_reads,
        &artifacts.filtered_reads,
        &artifacts.fastp_html,
        &artifacts.fastp_json,
        &artifacts.sorted_bam,
        &artifacts.bam_index,
        &artifacts.alignment_stats,
        &artifacts.raw_vcf,
        &artifacts.raw_vcf_index,
        &artifacts.filtered_vcf,
        &artifacts.filtered_vcf_index,
        &artifacts.variant_stats,
        &artifacts.run_report,
    ] {
        assert!(is_non_empty_file(path), "missing {}", path.display());
    }
    assert!(!sample.output_dir.join(".staging").join("align-to-reference").exists());

    let report = VariantStatsReport::parse(&fs::read_to_string(&artifacts.variant_stats)?);
    assert_eq!(report.reads_passing_qc, Some(2));
    assert_eq!(report.alignment_rate, Some(100.0));
    assert_eq!((report.raw_variants, report.filtered_variants), (3, 2));
    assert_eq!((report.snps, report.indels), (1, 1));
    assert!(!report.no_variants);
    assert!(report.filter_pass_ratio.is_some());

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&artifacts.run_report)?)?;
    assert_eq!(json["status"], "Succeeded");
    assert_eq!(json["stages"].as_array().map(|s| s.len()), Some(6));

    let log = fs::read_to_string(sample.pipeline_log())?;
    assert!(log.contains("=== combine-inputs"));
    assert!(log.contains("=== summarize-statistics"));
    Ok(())
}

#[tokio::test]
async fn test_second_run_invokes_nothing() -> Result<()> {
    let root = tempdir()?;
    let fasta = batch_root(root.path(), &["barcode01"])?;
    let sample = Sample::from_dir(&root.path().join("barcode01"))?;
    let reference = Reference::new(&fasta)?;

    let first = Arc::new(FakeRunner::new());
    assert!(pipeline_with(first).run(&sample, &reference, 4).await.is_success());

    let second = Arc::new(FakeRunner::new());
    let run = pipeline_with(second.clone()).run(&sample, &reference, 4).await;
    assert!(run.is_success());
    assert_eq!(run.stages.len(), 6);
    assert!(run.stages.iter().all(|r| r.status == StageStatus::Skipped));
    assert!(second.tools().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_resume_after_failure_skips_completed_stages() -> Result<()> {
    let root = tempdir()?;
    let fasta = batch_root(root.path(), &["barcode01"])?;
    let sample = Sample::from_dir(&root.path().join("barcode01"))?;
    let reference = Reference::new(&fasta)?;

    let broken = Arc::new(FakeRunner::new().failing("barcode01", "run_clair3.sh"));
    let run = pipeline_with(broken.clone()).run(&sample, &reference, 4).await;
    assert_eq!(run.status, RunStatus::FailedAt(StageName::CallVariants));
    assert_eq!(run.stages.len(), 4);
    assert!(!broken.tools().contains(&"bcftools".to_string()));
    let reason = run.failure().map(|r| r.code);
    assert_eq!(reason, Some(ReasonCode::ToolExit));
    assert!(matches!(run.error(), Some(PipelineError::ToolExecution { .. })));

    let log = fs::read_to_string(sample.pipeline_log())?;
    assert!(log.contains("pipeline FAILED at call-variants"));
    assert!(log.contains("[tool-exit]"));

    let fixed = Arc::new(FakeRunner::new());
    let run = pipeline_with(fixed.clone()).run(&sample, &reference, 4).await;
    assert!(run.is_success());
    let statuses: Vec<&StageStatus> = run.stages.iter().map(|r| &r.status).collect();
    assert_eq!(statuses[..3], [&StageStatus::Skipped, &StageStatus::Skipped, &StageStatus::Skipped]);
    assert_eq!(fixed.tools(), vec!["run_clair3.sh", "bcftools", "bcftools"]);
    Ok(())
}

#[tokio::test]
async fn test_empty_variants_are_copied_forward() -> Result<()> {
    let root = tempdir()?;
    let fasta = batch_root(root.path(), &["barcode03"])?;
    let sample = Sample::from_dir(&root.path().join("barcode03"))?;
    let reference = Reference::new(&fasta)?;
    let runner = Arc::new(FakeRunner::new().without_variants("barcode03"));

    let run = pipeline_with(runner.clone()).run(&sample, &reference, 4).await;
    assert!(run.is_success(), "{:?}", run.failure());
    assert!(!runner.tools().contains(&"bcftools".to_string()));

    let artifacts = SampleArtifacts::for_sample(&sample);
    assert_eq!(fs::read(&artifacts.raw_vcf)?, fs::read(&artifacts.filtered_vcf)?);
    assert_eq!(fs::read(&artifacts.raw_vcf_index)?, fs::read(&artifacts.filtered_vcf_index)?);

    let text = fs::read_to_string(&artifacts.variant_stats)?;
    assert!(text.contains("note: no variants found"));
    assert!(!text.contains("filter_pass_ratio"));
    assert!(text.contains("raw_variants: 0"));
    Ok(())
}

#[tokio::test]
async fn test_sample_without_reads_never_invokes_tools() -> Result<()> {
    let root = tempdir()?;
    let fasta = batch_root(root.path(), &[])?;
    let dir = root.path().join("barcode09");
    fs::create_dir(&dir)?;
    fs::write(dir.join("notes.txt"), b"no reads here")?;
    let sample = Sample::from_dir(&dir)?;
    let reference = Reference::new(&fasta)?;
    let runner = Arc::new(FakeRunner::new());

    let run = pipeline_with(runner.clone()).run(&sample, &reference, 4).await;
    assert!(matches!(run.status, RunStatus::AbortedUsageError(_)));
    assert!(matches!(run.error(), Some(PipelineError::Usage(_))));
    assert!(run.stages.is_empty());
    assert!(runner.tools().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_threads_never_exceed_sample_budget() -> Result<()> {
    let root = tempdir()?;
    let fasta = batch_root(root.path(), &["barcode01"])?;
    let sample = Sample::from_dir(&root.path().join("barcode01"))?;
    let reference = Reference::new(&fasta)?;
    let runner = Arc::new(FakeRunner::new());

    assert!(pipeline_with(runner.clone()).run(&sample, &reference, 3).await.is_success());
    for call in runner.calls.lock().unwrap().iter() {
        for flag in ["-t", "-@", "-w", "--threads"] {
            // bcftools index -t is a format flag, not a thread count
            let value = call
                .args
                .iter()
                .position(|a| a == flag)
                .and_then(|pos| call.args.get(pos + 1))
                .and_then(|next| next.parse::<usize>().ok());
            if let Some(threads) = value {
                assert!(threads <= 3, "{} {} {}", call.tool, flag, threads);
            }
        }
        for arg in &call.args {
            if let Some(value) = arg.strip_prefix("--threads=") {
                assert!(value.parse::<usize>()? <= 3);
            }
        }
    }
    Ok(())
}
