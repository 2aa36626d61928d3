use std::path::PathBuf;
use thiserror::Error;
use crate::config::capability::EnvironmentMap;

// External software
pub const GZIP_EXT: &str = "gz";
pub const FASTP_TAG: &str = "fastp";
pub const MINIMAP2_TAG: &str = "minimap2";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BCFTOOLS_TAG: &str = "bcftools";
pub const CLAIR3_TAG: &str = "run_clair3.sh";

// fastp refuses more worker threads than this
pub const FASTP_MAX_THREADS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Sort,
    Index,
    Flagstat,
    Faidx,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BcftoolsSubcommand {
    View,
    Index,
}

// Static Filenames
pub const ANALYSIS_DIR: &str = "analysis_output";
pub const STAGING_DIR: &str = ".staging";
pub const QC_DIR: &str = "qc";
pub const BATCH_SUMMARY: &str = "batch_summary.txt";
pub const CLAIR3_MERGED_VCF: &str = "merge_output.vcf.gz";

pub const COMBINED_READS_SUFFIX: &str = "combined.fastq.gz";
pub const FILTERED_READS_SUFFIX: &str = "filtered.fastq.gz";
pub const FASTP_HTML_SUFFIX: &str = "fastp.html";
pub const FASTP_JSON_SUFFIX: &str = "fastp.json";
pub const SORTED_BAM_SUFFIX: &str = "sorted.bam";
pub const BAM_INDEX_EXT: &str = "bai";
pub const ALIGNMENT_STATS_SUFFIX: &str = "alignment_stats.txt";
pub const RAW_VCF_SUFFIX: &str = "raw.vcf.gz";
pub const FILTERED_VCF_SUFFIX: &str = "filtered.vcf.gz";
pub const VCF_INDEX_EXT: &str = "tbi";
pub const VARIANT_STATS_SUFFIX: &str = "variant_stats.txt";
pub const PIPELINE_LOG_SUFFIX: &str = "pipeline.log";
pub const RUN_REPORT_SUFFIX: &str = "run_report.json";
pub const BATCH_LOG_SUFFIX: &str = "batch.log";

pub const NO_VARIANTS_NOTE: &str = "no variants found";

// Static Parameters
pub const DEFAULT_SAMPLE_THREADS: usize = 8;
pub const DEFAULT_SAMPLE_PATTERN: &str = r"^barcode\d+$";
pub const DEFAULT_MIN_QUALITY: u8 = 10;
pub const DEFAULT_MIN_LENGTH: usize = 200;
pub const DEFAULT_MIN_VARIANT_QUALITY: u32 = 20;
pub const DEFAULT_CLAIR3_PLATFORM: &str = "ont";

pub const FASTQ_EXTS: &[&'static str] = &["fastq", "fq"];
pub const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fna"];


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Precondition failed for {stage}: {detail}")]
    Precondition { stage: String, detail: String },

    #[error("Tool {tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("Output validation failed for {stage}: {detail}")]
    OutputValidation { stage: String, detail: String },

    #[error("Requested {requested} threads exceeds the budget of {budget}")]
    Oversubscription { requested: usize, budget: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


/// Settings shared by every sample in a run. Thread counts are not here:
/// they arrive per sample from the scheduler.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub environments: EnvironmentMap,
    pub min_quality: u8,
    pub min_length: usize,
    pub min_variant_quality: u32,
    pub clair3_platform: String,
    pub clair3_model: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            environments: EnvironmentMap::default(),
            min_quality: DEFAULT_MIN_QUALITY,
            min_length: DEFAULT_MIN_LENGTH,
            min_variant_quality: DEFAULT_MIN_VARIANT_QUALITY,
            clair3_platform: DEFAULT_CLAIR3_PLATFORM.to_string(),
            clair3_model: None,
            verbose: false,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let model = self
            .clair3_model
            .as_ref()
            .ok_or_else(|| PipelineError::Usage("--model is required for variant calling".to_string()))?;
        if !model.exists() {
            return Err(PipelineError::InvalidConfig(format!("Clair3 model not found: {}", model.display())));
        }
        if self.clair3_platform.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("Clair3 platform must not be empty".to_string()));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_requires_model() {
        let config = RunConfig::default();
        assert!(matches!(config.validate(), Err(PipelineError::Usage(_))));
    }

    #[test]
    fn test_validate_model_must_exist() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut config = RunConfig { clair3_model: Some(dir.path().join("missing")), ..RunConfig::default() };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));

        config.clair3_model = Some(dir.path().to_path_buf());
        assert!(config.validate().is_ok());
        config.clair3_platform = " ".to_string();
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
        Ok(())
    }
}
