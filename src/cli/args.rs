use std::path::PathBuf;
use clap::{Args, Parser, ValueEnum};
use crate::config::capability::{EnvironmentMap, DEFAULT_LAUNCHER};
use crate::config::defs::{
    PipelineError, RunConfig, DEFAULT_CLAIR3_PLATFORM, DEFAULT_MIN_LENGTH, DEFAULT_MIN_QUALITY,
    DEFAULT_MIN_VARIANT_QUALITY, DEFAULT_SAMPLE_PATTERN, DEFAULT_SAMPLE_THREADS,
};
use crate::pipelines::batch::Strategy;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum StrategyKind {
    MaximumParallelism,
    Balanced,
    SpeedPriority,
    Custom,
}

/// Environment and threshold flags shared by both binaries.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct ToolArgs {
    #[arg(long = "qc-env", help = "Environment providing fastp")]
    pub qc_env: Option<String>,

    #[arg(long = "align-env", help = "Environment providing minimap2, samtools and bcftools")]
    pub align_env: Option<String>,

    #[arg(long = "caller-env", help = "Environment providing run_clair3.sh")]
    pub caller_env: Option<String>,

    #[arg(long = "env-launcher", default_value = DEFAULT_LAUNCHER)]
    pub env_launcher: String,

    #[arg(short = 'q', long = "quality", default_value_t = DEFAULT_MIN_QUALITY)]
    pub min_quality: u8,

    #[arg(short = 'l', long = "min-length", default_value_t = DEFAULT_MIN_LENGTH)]
    pub min_length: usize,

    #[arg(long = "min-variant-quality", default_value_t = DEFAULT_MIN_VARIANT_QUALITY)]
    pub min_variant_quality: u32,

    #[arg(long, default_value = DEFAULT_CLAIR3_PLATFORM)]
    pub platform: String,

    #[arg(long = "model", help = "Clair3 model directory")]
    pub model: Option<PathBuf>,

    #[arg(long = "skip-tool-check", default_value_t = false)]
    pub skip_tool_check: bool,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,
}

impl ToolArgs {
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            environments: EnvironmentMap {
                qc: self.qc_env.clone(),
                alignment: self.align_env.clone(),
                caller: self.caller_env.clone(),
                launcher: self.env_launcher.clone(),
            },
            min_quality: self.min_quality,
            min_length: self.min_length,
            min_variant_quality: self.min_variant_quality,
            clair3_platform: self.platform.clone(),
            clair3_model: self.model.clone(),
            verbose: self.verbose,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "varseq-pipelines", version, about = "Per-sample variant calling pipeline")]
pub struct PipelineArgs {
    pub sample_dir: PathBuf,

    pub reference: PathBuf,

    #[arg(default_value_t = DEFAULT_SAMPLE_THREADS)]
    pub threads: usize,

    #[command(flatten)]
    pub tools: ToolArgs,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "varseq-batch", version, about = "Runs the variant calling pipeline over many samples")]
pub struct BatchArgs {
    pub root: PathBuf,

    pub reference: PathBuf,

    #[arg(long, default_value = DEFAULT_SAMPLE_PATTERN, help = "Regex for sample directory names")]
    pub pattern: String,

    #[arg(short = 't', long, help = "Total thread budget; defaults to the physical core count")]
    pub threads: Option<usize>,

    #[arg(short = 's', long, value_enum, help = "Skip the interactive menu")]
    pub strategy: Option<StrategyKind>,

    #[arg(long, help = "Concurrent jobs for --strategy custom")]
    pub jobs: Option<usize>,

    #[arg(long = "threads-per-job", help = "Threads per job for --strategy custom")]
    pub threads_per_job: Option<usize>,

    #[arg(short = 'y', long = "yes", default_value_t = false, help = "Accept an oversubscribed allocation")]
    pub yes: bool,

    #[command(flatten)]
    pub tools: ToolArgs,
}

impl BatchArgs {
    /// Strategy from the command line, if one was given.
    pub fn strategy(&self) -> Result<Option<Strategy>, PipelineError> {
        let strategy = match self.strategy {
            None => return Ok(None),
            Some(StrategyKind::MaximumParallelism) => Strategy::MaximumParallelism,
            Some(StrategyKind::Balanced) => Strategy::Balanced,
            Some(StrategyKind::SpeedPriority) => Strategy::SpeedPriority,
            Some(StrategyKind::Custom) => match (self.jobs, self.threads_per_job) {
                (Some(jobs), Some(threads_per_job)) => Strategy::custom(jobs, threads_per_job)?,
                _ => {
                    return Err(PipelineError::Usage(
                        "--strategy custom needs --jobs and --threads-per-job".to_string(),
                    ));
                }
            },
        };
        Ok(Some(strategy))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let args = PipelineArgs::parse_from(["varseq-pipelines", "barcode01", "ref.fa"]);
        assert_eq!(args.threads, 8);
        let config = args.tools.run_config();
        assert_eq!(config.min_quality, 10);
        assert_eq!(config.environments.launcher, "conda");
        assert!(config.environments.qc.is_none());
    }

    #[test]
    fn test_batch_custom_strategy() -> Result<(), PipelineError> {
        let args = BatchArgs::parse_from([
            "varseq-batch", "runs", "ref.fa", "--strategy", "custom", "--jobs", "4", "--threads-per-job", "8",
        ]);
        assert_eq!(args.strategy()?, Some(Strategy::Custom { jobs: 4, threads_per_job: 8 }));

        let incomplete = BatchArgs::parse_from(["varseq-batch", "runs", "ref.fa", "--strategy", "custom"]);
        assert!(incomplete.strategy().is_err());
        Ok(())
    }
}
