//! Per-sample variant calling pipeline:
//! combine → quality filter → align → call → filter → summarize.

use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use log::{error, info, warn};
use serde::Serialize;
use crate::config::capability::{Capability, CapabilityContext};
use crate::config::defs::{
    BcftoolsSubcommand, PipelineError, RunConfig, SamtoolsSubcommand, ALIGNMENT_STATS_SUFFIX, BAM_INDEX_EXT,
    CLAIR3_MERGED_VCF, COMBINED_READS_SUFFIX, FASTP_HTML_SUFFIX, FASTP_JSON_SUFFIX, FILTERED_READS_SUFFIX,
    FILTERED_VCF_SUFFIX, NO_VARIANTS_NOTE, QC_DIR, RAW_VCF_SUFFIX, RUN_REPORT_SUFFIX, SORTED_BAM_SUFFIX,
    VARIANT_STATS_SUFFIX, VCF_INDEX_EXT,
};
use crate::pipelines::stage::{
    FailureReason, ReasonCode, Stage, StageIo, StageName, StagePlan, StageResult, StageRunner, StageStatus, Step,
};
use crate::utils::command::bcftools::BcftoolsConfig;
use crate::utils::command::fastp::FastpConfig;
use crate::utils::command::samtools::SamtoolsConfig;
use crate::utils::command::{bcftools, clair3, fastp, minimap2, samtools, ToolRunner};
use crate::utils::fastq::count_reads;
use crate::utils::file::{append_to_file, is_non_empty_file, with_added_extension};
use crate::utils::reference::{IndexKind, Reference};
use crate::utils::sambam::read_flagstat;
use crate::utils::sample::Sample;
use crate::utils::vcf::{count_variants, has_no_records};


#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunStatus {
    Succeeded,
    FailedAt(StageName),
    AbortedUsageError(String),
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::FailedAt(stage) => write!(f, "failed at {}", stage),
            RunStatus::AbortedUsageError(detail) => write!(f, "aborted (usage error: {})", detail),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub sample: Sample,
    pub stages: Vec<StageResult>,
    pub status: RunStatus,
    pub output_dir: PathBuf,
    pub threads: usize,
}

impl PipelineRun {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.stages.iter().find_map(|result| match &result.status {
            StageStatus::Failed(reason) => Some(reason),
            _ => None,
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.stages.iter().map(|result| result.duration).sum()
    }

    /// The run's failure in error taxonomy terms; None on success.
    pub fn error(&self) -> Option<PipelineError> {
        let stage = match &self.status {
            RunStatus::Succeeded => return None,
            RunStatus::AbortedUsageError(detail) => return Some(PipelineError::Usage(detail.clone())),
            RunStatus::FailedAt(stage) => stage.to_string(),
        };
        let Some(reason) = self.failure() else {
            return Some(PipelineError::ToolExecution { tool: stage, error: "unknown failure".to_string() });
        };
        Some(match reason.code {
            ReasonCode::MissingInput | ReasonCode::IndexUnavailable => {
                PipelineError::Precondition { stage, detail: reason.to_string() }
            }
            ReasonCode::OutputValidation => PipelineError::OutputValidation { stage, detail: reason.detail.clone() },
            ReasonCode::ToolExit | ReasonCode::ToolSpawn | ReasonCode::Io => {
                PipelineError::ToolExecution { tool: stage, error: reason.to_string() }
            }
        })
    }
}


/// Deterministic artifact locations for one sample.
#[derive(Debug, Clone)]
pub struct SampleArtifacts {
    pub combined_reads: PathBuf,
    pub filtered_reads: PathBuf,
    pub fastp_html: PathBuf,
    pub fastp_json: PathBuf,
    pub sorted_bam: PathBuf,
    pub bam_index: PathBuf,
    pub alignment_stats: PathBuf,
    pub raw_vcf: PathBuf,
    pub raw_vcf_index: PathBuf,
    pub filtered_vcf: PathBuf,
    pub filtered_vcf_index: PathBuf,
    pub variant_stats: PathBuf,
    pub run_report: PathBuf,
}

impl SampleArtifacts {
    pub fn for_sample(sample: &Sample) -> Self {
        let sorted_bam = sample.artifact(SORTED_BAM_SUFFIX);
        let raw_vcf = sample.artifact(RAW_VCF_SUFFIX);
        let filtered_vcf = sample.artifact(FILTERED_VCF_SUFFIX);
        SampleArtifacts {
            combined_reads: sample.artifact(COMBINED_READS_SUFFIX),
            filtered_reads: sample.artifact(FILTERED_READS_SUFFIX),
            fastp_html: sample.nested_artifact(QC_DIR, FASTP_HTML_SUFFIX),
            fastp_json: sample.nested_artifact(QC_DIR, FASTP_JSON_SUFFIX),
            bam_index: with_added_extension(&sorted_bam, BAM_INDEX_EXT),
            sorted_bam,
            alignment_stats: sample.artifact(ALIGNMENT_STATS_SUFFIX),
            raw_vcf_index: with_added_extension(&raw_vcf, VCF_INDEX_EXT),
            raw_vcf,
            filtered_vcf_index: with_added_extension(&filtered_vcf, VCF_INDEX_EXT),
            filtered_vcf,
            variant_stats: sample.artifact(VARIANT_STATS_SUFFIX),
            run_report: sample.artifact(RUN_REPORT_SUFFIX),
        }
    }
}


/// Contents of `<id>_variant_stats.txt`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VariantStatsReport {
    pub sample: String,
    pub reads_passing_qc: Option<u64>,
    pub alignment_rate: Option<f64>,
    pub raw_variants: u64,
    pub filtered_variants: u64,
    pub snps: u64,
    pub mnps: u64,
    pub indels: u64,
    /// filtered / raw; absent when nothing was called.
    pub filter_pass_ratio: Option<f64>,
    pub no_variants: bool,
}

impl VariantStatsReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "sample: {}", self.sample);
        if let Some(reads) = self.reads_passing_qc {
            let _ = writeln!(out, "reads_passing_qc: {}", reads);
        }
        if let Some(rate) = self.alignment_rate {
            let _ = writeln!(out, "alignment_rate: {:.2}%", rate);
        }
        let _ = writeln!(out, "raw_variants: {}", self.raw_variants);
        let _ = writeln!(out, "filtered_variants: {}", self.filtered_variants);
        let _ = writeln!(out, "snps: {}", self.snps);
        let _ = writeln!(out, "mnps: {}", self.mnps);
        let _ = writeln!(out, "indels: {}", self.indels);
        match self.filter_pass_ratio {
            Some(ratio) if !self.no_variants => {
                let _ = writeln!(out, "filter_pass_ratio: {:.4}", ratio);
            }
            _ => {
                let _ = writeln!(out, "note: {}", NO_VARIANTS_NOTE);
            }
        }
        out
    }

    /// Lenient reader: unknown keys are ignored, missing keys stay default.
    pub fn parse(text: &str) -> VariantStatsReport {
        let mut report = VariantStatsReport::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else { continue };
            let value = value.trim();
            match key.trim() {
                "sample" => report.sample = value.to_string(),
                "reads_passing_qc" => report.reads_passing_qc = value.parse().ok(),
                "alignment_rate" => report.alignment_rate = value.trim_end_matches('%').parse().ok(),
                "raw_variants" => report.raw_variants = value.parse().unwrap_or(0),
                "filtered_variants" => report.filtered_variants = value.parse().unwrap_or(0),
                "snps" => report.snps = value.parse().unwrap_or(0),
                "mnps" => report.mnps = value.parse().unwrap_or(0),
                "indels" => report.indels = value.parse().unwrap_or(0),
                "filter_pass_ratio" => report.filter_pass_ratio = value.parse().ok(),
                "note" if value == NO_VARIANTS_NOTE => report.no_variants = true,
                _ => {}
            }
        }
        report
    }
}

fn build_variant_stats(sample_id: &str, artifacts: &SampleArtifacts) -> Result<VariantStatsReport> {
    let reads = count_reads(&artifacts.filtered_reads)?;
    let flagstat = read_flagstat(&artifacts.alignment_stats)?;
    let raw = count_variants(&artifacts.raw_vcf)?;
    let no_variants = raw.is_empty();
    let filtered = if no_variants { raw } else { count_variants(&artifacts.filtered_vcf)? };
    Ok(VariantStatsReport {
        sample: sample_id.to_string(),
        reads_passing_qc: Some(reads),
        alignment_rate: Some(flagstat.alignment_rate),
        raw_variants: raw.records,
        filtered_variants: filtered.records,
        snps: filtered.snps,
        mnps: filtered.mnps,
        indels: filtered.indels,
        filter_pass_ratio: (!no_variants).then(|| filtered.records as f64 / raw.records as f64),
        no_variants,
    })
}


pub struct Pipeline {
    runner: Arc<dyn ToolRunner>,
    config: Arc<RunConfig>,
}

impl Pipeline {
    pub fn new(runner: Arc<dyn ToolRunner>, config: Arc<RunConfig>) -> Self {
        Pipeline { runner, config }
    }

    /// The fixed stage sequence for one sample. Every thread count is carved
    /// out of `threads` and never exceeds it.
    pub fn stages(&self, sample: &Sample, reference: &Reference, threads: usize) -> Vec<Stage> {
        let artifacts = SampleArtifacts::for_sample(sample);
        let minor_threads = (threads / 4).max(1);

        let combine = {
            let reads = sample.reads.clone();
            let out = artifacts.combined_reads.clone();
            Stage {
                name: StageName::CombineInputs,
                capability: Capability::Builtin,
                inputs: sample.reads.clone(),
                outputs: vec![artifacts.combined_reads.clone()],
                index: None,
                threads,
                template: Box::new(move |io: &StageIo, _ctx: &CapabilityContext| -> Result<StagePlan> {
                    Ok(StagePlan {
                        steps: vec![Step::Concatenate { inputs: reads.clone(), output: io.staged(&out) }],
                        note: None,
                    })
                }),
            }
        };

        let quality_filter = {
            let a = artifacts.clone();
            let config = self.config.clone();
            Stage {
                name: StageName::QualityFilter,
                capability: Capability::QcTools,
                inputs: vec![artifacts.combined_reads.clone()],
                outputs: vec![artifacts.filtered_reads.clone(), artifacts.fastp_html.clone(), artifacts.fastp_json.clone()],
                index: None,
                threads,
                template: Box::new(move |io: &StageIo, ctx: &CapabilityContext| -> Result<StagePlan> {
                    let (output, html_report, json_report) =
                        (io.staged(&a.filtered_reads), io.staged(&a.fastp_html), io.staged(&a.fastp_json));
                    if let Some(qc_dir) = html_report.parent() {
                        std::fs::create_dir_all(qc_dir)?;
                    }
                    let fastp_config = FastpConfig {
                        input: &a.combined_reads,
                        output: &output,
                        html_report: &html_report,
                        json_report: &json_report,
                        threads: io.threads,
                    };
                    Ok(StagePlan { steps: vec![Step::Tool(fastp::invocation(ctx, &config, &fastp_config))], note: None })
                }),
            }
        };

        let align = {
            let a = artifacts.clone();
            let mmi = reference.index_path(IndexKind::Minimap2);
            let sample_id = sample.id.clone();
            Stage {
                name: StageName::AlignToReference,
                capability: Capability::AlignmentTools,
                inputs: vec![artifacts.filtered_reads.clone()],
                outputs: vec![artifacts.sorted_bam.clone(), artifacts.bam_index.clone(), artifacts.alignment_stats.clone()],
                index: Some(IndexKind::Minimap2),
                threads,
                template: Box::new(move |io: &StageIo, ctx: &CapabilityContext| -> Result<StagePlan> {
                    let sam = io.staging.join(format!("{}_aligned.sam", sample_id));
                    let (bam, bai, stats) = (io.staged(&a.sorted_bam), io.staged(&a.bam_index), io.staged(&a.alignment_stats));
                    let steps = vec![
                        Step::Tool(minimap2::align(ctx, &mmi, &a.filtered_reads, &sam, io.threads)),
                        Step::Tool(samtools::invocation(ctx, &SamtoolsConfig {
                            subcommand: SamtoolsSubcommand::Sort,
                            input: &sam,
                            output: Some(&bam),
                            threads: io.threads,
                        })),
                        Step::Tool(samtools::invocation(ctx, &SamtoolsConfig {
                            subcommand: SamtoolsSubcommand::Index,
                            input: &bam,
                            output: Some(&bai),
                            threads: minor_threads,
                        })),
                        Step::Tool(samtools::invocation(ctx, &SamtoolsConfig {
                            subcommand: SamtoolsSubcommand::Flagstat,
                            input: &bam,
                            output: Some(&stats),
                            threads: minor_threads,
                        })),
                    ];
                    Ok(StagePlan { steps, note: None })
                }),
            }
        };

        let call = {
            let a = artifacts.clone();
            let config = self.config.clone();
            let fasta = reference.fasta.clone();
            Stage {
                name: StageName::CallVariants,
                capability: Capability::VariantCaller,
                inputs: vec![artifacts.sorted_bam.clone(), artifacts.bam_index.clone()],
                outputs: vec![artifacts.raw_vcf.clone(), artifacts.raw_vcf_index.clone()],
                index: Some(IndexKind::Faidx),
                threads,
                template: Box::new(move |io: &StageIo, ctx: &CapabilityContext| -> Result<StagePlan> {
                    let caller_dir = io.staging.join("clair3");
                    let merged = caller_dir.join(CLAIR3_MERGED_VCF);
                    let steps = vec![
                        Step::Tool(clair3::invocation(ctx, &config, &a.sorted_bam, &fasta, &caller_dir, io.threads)),
                        Step::Move { from: with_added_extension(&merged, VCF_INDEX_EXT), to: io.staged(&a.raw_vcf_index) },
                        Step::Move { from: merged, to: io.staged(&a.raw_vcf) },
                    ];
                    Ok(StagePlan { steps, note: None })
                }),
            }
        };

        let filter = {
            let a = artifacts.clone();
            let min_quality = self.config.min_variant_quality;
            Stage {
                name: StageName::FilterVariants,
                capability: Capability::AlignmentTools,
                inputs: vec![artifacts.raw_vcf.clone(), artifacts.raw_vcf_index.clone()],
                outputs: vec![artifacts.filtered_vcf.clone(), artifacts.filtered_vcf_index.clone()],
                index: None,
                threads,
                template: Box::new(move |io: &StageIo, ctx: &CapabilityContext| -> Result<StagePlan> {
                    let (vcf, tbi) = (io.staged(&a.filtered_vcf), io.staged(&a.filtered_vcf_index));
                    if has_no_records(&a.raw_vcf)? {
                        // Nothing to filter: carry the raw calls forward untouched
                        return Ok(StagePlan {
                            steps: vec![
                                Step::Copy { from: a.raw_vcf.clone(), to: vcf },
                                Step::Copy { from: a.raw_vcf_index.clone(), to: tbi },
                            ],
                            note: Some(format!("{}; raw calls copied forward", NO_VARIANTS_NOTE)),
                        });
                    }
                    let steps = vec![
                        Step::Tool(bcftools::invocation(ctx, &BcftoolsConfig {
                            subcommand: BcftoolsSubcommand::View,
                            input: &a.raw_vcf,
                            output: &vcf,
                            threads: io.threads,
                            min_quality: Some(min_quality),
                        })),
                        Step::Tool(bcftools::invocation(ctx, &BcftoolsConfig {
                            subcommand: BcftoolsSubcommand::Index,
                            input: &vcf,
                            output: &tbi,
                            threads: io.threads,
                            min_quality: None,
                        })),
                    ];
                    Ok(StagePlan { steps, note: None })
                }),
            }
        };

        let summarize = {
            let a = artifacts.clone();
            let sample_id = sample.id.clone();
            Stage {
                name: StageName::SummarizeStatistics,
                capability: Capability::Builtin,
                inputs: vec![
                    artifacts.filtered_reads.clone(),
                    artifacts.alignment_stats.clone(),
                    artifacts.raw_vcf.clone(),
                    artifacts.filtered_vcf.clone(),
                ],
                outputs: vec![artifacts.variant_stats.clone()],
                index: None,
                threads,
                template: Box::new(move |io: &StageIo, _ctx: &CapabilityContext| -> Result<StagePlan> {
                    let report = build_variant_stats(&sample_id, &a)?;
                    let note = report.no_variants.then(|| NO_VARIANTS_NOTE.to_string());
                    Ok(StagePlan {
                        steps: vec![Step::WriteText { path: io.staged(&a.variant_stats), contents: report.render() }],
                        note,
                    })
                }),
            }
        };

        vec![combine, quality_filter, align, call, filter, summarize]
    }

    fn log(&self, sample: &Sample, text: &str) {
        if let Err(e) = append_to_file(&sample.pipeline_log(), text) {
            warn!("{}: could not write pipeline log: {}", sample.id, e);
        }
    }

    fn aborted(&self, sample: &Sample, threads: usize, detail: String) -> PipelineRun {
        error!("{}: {}", sample.id, detail);
        PipelineRun {
            sample: sample.clone(),
            stages: Vec::new(),
            status: RunStatus::AbortedUsageError(detail),
            output_dir: sample.output_dir.clone(),
            threads,
        }
    }

    /// Runs every stage in order, stopping at the first failure.
    ///
    /// # Arguments
    ///
    /// * `sample` - Sample to process.
    /// * `reference` - Reference genome.
    /// * `threads` - Thread budget for this sample; no tool gets more.
    ///
    /// # Returns
    /// PipelineRun with one StageResult per attempted stage.
    pub async fn run(&self, sample: &Sample, reference: &Reference, threads: usize) -> PipelineRun {
        if sample.reads.is_empty() {
            return self.aborted(sample, threads, format!("no read files found in {}", sample.root.display()));
        }
        if threads == 0 {
            return self.aborted(sample, threads, "thread budget must be at least 1".to_string());
        }

        let stages = self.stages(sample, reference, threads);
        let artifacts = SampleArtifacts::for_sample(sample);
        self.log(
            sample,
            &format!(
                "##### {} pipeline start ({}) threads={} reference={}",
                sample.id,
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                threads,
                reference.fasta.display()
            ),
        );

        let mut results = Vec::with_capacity(stages.len());
        let mut status = RunStatus::Succeeded;

        if is_non_empty_file(&artifacts.variant_stats) {
            info!("{}: final report present, nothing to do", sample.id);
            self.log(sample, "final report already present; all stages skipped");
            for stage in &stages {
                results.push(StageResult {
                    stage: stage.name,
                    status: StageStatus::Skipped,
                    artifacts: stage.outputs.clone(),
                    log: sample.pipeline_log(),
                    duration: Duration::ZERO,
                    note: None,
                });
            }
        } else {
            let stage_runner = StageRunner::new(self.runner.clone(), reference.clone())
                .with_index_context(self.config.environments.context(Capability::AlignmentTools));
            for stage in &stages {
                let context = self.config.environments.context(stage.capability);
                let result = stage_runner.run(stage, sample, &context).await;
                let failed = result.status.is_failed();
                results.push(result);
                if failed {
                    status = RunStatus::FailedAt(stage.name);
                    break;
                }
            }
        }

        let run = PipelineRun {
            sample: sample.clone(),
            stages: results,
            status,
            output_dir: sample.output_dir.clone(),
            threads,
        };

        match (&run.status, run.failure()) {
            (RunStatus::FailedAt(stage), Some(reason)) => {
                self.log(sample, &format!("##### pipeline FAILED at {}: {}", stage, reason));
            }
            _ => self.log(sample, &format!("##### pipeline {}", run.status)),
        }
        if let Err(e) = write_run_report(&run, &artifacts.run_report) {
            warn!("{}: could not write run report: {}", sample.id, e);
        }
        run
    }
}

pub fn write_run_report(run: &PipelineRun, path: &Path) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(run).map_err(|e| PipelineError::IOError(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    Ok(())
}
