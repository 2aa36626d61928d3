//! Post-run scan of sample output directories.
//!
//! The batch result says what each worker reported; the disk says what was
//! actually produced. A sample only counts as succeeded when both agree.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::Duration;
use log::{debug, warn};
use crate::config::defs::{PipelineError, VARIANT_STATS_SUFFIX};
use crate::pipelines::batch::{Allocation, BatchResult};
use crate::pipelines::variant_calling::VariantStatsReport;
use crate::utils::file::is_non_empty_file;
use crate::utils::sample::Sample;


#[derive(Debug, Clone, PartialEq)]
pub struct SampleSummary {
    pub id: String,
    pub succeeded: bool,
    pub status: String,
    pub filtered_variants: Option<u64>,
    pub alignment_rate: Option<f64>,
    pub no_variants: bool,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub allocation: Allocation,
    pub elapsed: Duration,
    pub samples: Vec<SampleSummary>,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_ids: Vec<String>,
}

impl BatchReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Batch summary");
        let _ = writeln!(out, "strategy: {}", self.allocation.strategy);
        let _ = writeln!(
            out,
            "allocation: {} concurrent job(s) x {} thread(s), budget {}",
            self.allocation.max_concurrent_jobs, self.allocation.threads_per_job, self.allocation.budget
        );
        let _ = writeln!(out, "elapsed: {:.1}s", self.elapsed.as_secs_f64());
        let _ = writeln!(out, "succeeded: {}", self.succeeded);
        let _ = writeln!(out, "failed: {}", self.failed);
        let _ = writeln!(out);
        for sample in &self.samples {
            let variants = match (sample.no_variants, sample.filtered_variants) {
                (true, _) => "no variants found".to_string(),
                (false, Some(count)) => format!("{} variants", count),
                (false, None) => "variants n/a".to_string(),
            };
            let rate = sample
                .alignment_rate
                .map(|rate| format!("{:.2}% aligned", rate))
                .unwrap_or_else(|| "alignment n/a".to_string());
            let _ = write!(out, "{}\t{}\t{}\t{}", sample.id, sample.status, variants, rate);
            if !sample.notes.is_empty() {
                let _ = write!(out, "\t[{}]", sample.notes.join("; "));
            }
            let _ = writeln!(out);
        }
        if !self.failed_ids.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "failed samples: {}", self.failed_ids.join(", "));
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        fs::write(path, self.render())?;
        Ok(())
    }
}


/// Reconciles recorded outcomes with the artifacts on disk and pulls headline
/// metrics out of each variant statistics report.
///
/// # Arguments
///
/// * `batch` - What the workers reported.
/// * `samples` - Every sample in the batch; their output directories are scanned.
///
/// # Returns
/// BatchReport, one entry per sample in the given order.
pub fn summarize(batch: &BatchResult, samples: &[Sample]) -> BatchReport {
    let mut summaries = Vec::with_capacity(samples.len());
    for sample in samples {
        let record = batch.records.iter().find(|record| record.sample.id == sample.id);
        let recorded_success = record.map(|record| record.is_success()).unwrap_or(false);
        let final_artifact = sample.artifact(VARIANT_STATS_SUFFIX);
        let on_disk = is_non_empty_file(&final_artifact);

        let mut notes = Vec::new();
        let status = match record {
            Some(record) => record.status_label(),
            None => {
                notes.push("no run recorded".to_string());
                "unknown".to_string()
            }
        };
        if recorded_success && !on_disk {
            notes.push(format!("reported success but {} is missing", final_artifact.display()));
        }
        if !recorded_success && on_disk {
            notes.push("report present from an earlier run".to_string());
        }
        if let Some(reason) = record.and_then(|record| record.reason()) {
            notes.push(reason);
        }

        let report = if on_disk {
            match fs::read_to_string(&final_artifact) {
                Ok(text) => Some(VariantStatsReport::parse(&text)),
                Err(e) => {
                    warn!("{}: cannot read {}: {}", sample.id, final_artifact.display(), e);
                    None
                }
            }
        } else {
            None
        };
        debug!("{}: recorded={} on_disk={}", sample.id, recorded_success, on_disk);

        summaries.push(SampleSummary {
            id: sample.id.clone(),
            succeeded: recorded_success && on_disk,
            status,
            filtered_variants: report.as_ref().map(|r| r.filtered_variants),
            alignment_rate: report.as_ref().and_then(|r| r.alignment_rate),
            no_variants: report.as_ref().map(|r| r.no_variants).unwrap_or(false),
            notes,
        });
    }

    let failed_ids: Vec<String> = summaries
        .iter()
        .filter(|summary| !summary.succeeded)
        .map(|summary| summary.id.clone())
        .collect();
    BatchReport {
        allocation: batch.allocation,
        elapsed: batch.elapsed,
        succeeded: summaries.len() - failed_ids.len(),
        failed: failed_ids.len(),
        failed_ids,
        samples: summaries,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;
    use crate::pipelines::batch::{plan, JobAllocation, SampleOutcome, SampleRecord, Strategy};
    use crate::pipelines::variant_calling::{PipelineRun, RunStatus};

    fn sample_in(root: &Path, id: &str) -> anyhow::Result<Sample> {
        let dir = root.join(id);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("reads.fastq"), b"@r\nA\n+\nI\n")?;
        Ok(Sample::from_dir(&dir)?)
    }

    fn record(sample: &Sample, status: RunStatus) -> SampleRecord {
        SampleRecord {
            sample: sample.clone(),
            job: JobAllocation { sample: sample.id.clone(), threads: 4, strategy: "balanced".to_string() },
            outcome: SampleOutcome::Completed(PipelineRun {
                sample: sample.clone(),
                stages: Vec::new(),
                status,
                output_dir: PathBuf::from(&sample.output_dir),
                threads: 4,
            }),
        }
    }

    #[test]
    fn test_reconciles_disk_with_records() -> anyhow::Result<()> {
        let root = tempdir()?;
        let good = sample_in(root.path(), "barcode01")?;
        let lost = sample_in(root.path(), "barcode02")?;

        fs::create_dir_all(&good.output_dir)?;
        let stats = VariantStatsReport {
            sample: good.id.clone(),
            alignment_rate: Some(97.25),
            raw_variants: 12,
            filtered_variants: 9,
            filter_pass_ratio: Some(0.75),
            ..Default::default()
        };
        fs::write(good.artifact(VARIANT_STATS_SUFFIX), stats.render())?;

        let records = vec![record(&good, RunStatus::Succeeded), record(&lost, RunStatus::Succeeded)];
        let batch = BatchResult {
            allocation: plan(2, 8, Strategy::Balanced)?,
            records,
            succeeded: 2,
            failed: 0,
            failed_ids: Vec::new(),
            elapsed: Duration::from_secs(3),
        };

        let report = summarize(&batch, &[good, lost]);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed_ids, vec!["barcode02".to_string()]);
        assert_eq!(report.samples[0].filtered_variants, Some(9));
        assert_eq!(report.samples[0].alignment_rate, Some(97.25));
        assert!(report.samples[1].notes[0].contains("is missing"));

        let text = report.render();
        assert!(text.contains("9 variants"));
        assert!(text.trim_end().ends_with("failed samples: barcode02"));
        Ok(())
    }
}
