use std::env;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{debug, error, info, warn};
use varseq_pipelines::cli::{parse, PipelineArgs};
use varseq_pipelines::config::defs::PipelineError;
use varseq_pipelines::init_logging;
use varseq_pipelines::pipelines::variant_calling::{Pipeline, SampleArtifacts};
use varseq_pipelines::utils::command::{check_versions, ProcessRunner, ToolRunner};
use varseq_pipelines::utils::reference::Reference;
use varseq_pipelines::utils::sample::Sample;
use varseq_pipelines::utils::system::{detect_cores_and_load, is_heavily_loaded};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();
    init_logging(args.tools.verbose);

    println!("\n-------------\n VarSeq\n-------------\n");

    let dir = env::current_dir()?;
    debug!("The current directory is {:?}", dir);

    if let Err(e) = run(args).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}

/// Validates the command line, then runs every stage for one sample.
async fn run(args: PipelineArgs) -> Result<(), PipelineError> {
    let sample = Sample::from_dir(&args.sample_dir)?;
    if sample.reads.is_empty() {
        return Err(PipelineError::Usage(format!("No read files found in {}", sample.root.display())));
    }
    let reference = Reference::new(&args.reference)?;
    if args.threads == 0 {
        return Err(PipelineError::Usage("Thread count must be at least 1".to_string()));
    }

    let run_config = Arc::new(args.tools.run_config());
    run_config.validate()?;

    let (max_cores, cpu_load) = detect_cores_and_load(None).await;
    debug!("Detected {} physical cores; CPU load {}%", max_cores, cpu_load);
    if args.threads > max_cores {
        warn!("Requested {} threads on a machine with {} physical cores", args.threads, max_cores);
    }
    if is_heavily_loaded(cpu_load) {
        warn!("CPU load is already {:.0}%", cpu_load);
    }

    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner);
    if !args.tools.skip_tool_check {
        check_versions(runner.as_ref(), &run_config.environments.tool_contexts()).await?;
    }

    info!("Sample {}: {} read file(s), {} threads", sample.id, sample.reads.len(), args.threads);
    let pipeline = Pipeline::new(runner, run_config);
    let pipeline_run = pipeline.run(&sample, &reference, args.threads).await;
    if let Some(e) = pipeline_run.error() {
        error!("See {} for details", sample.pipeline_log().display());
        return Err(e);
    }

    let artifacts = SampleArtifacts::for_sample(&sample);
    info!("Variant statistics: {}", artifacts.variant_stats.display());
    info!("Run report: {}", artifacts.run_report.display());
    Ok(())
}
