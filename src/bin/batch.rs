use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{debug, error, info, warn};
use varseq_pipelines::cli::menu::{choose_strategy, confirm_oversubscription};
use varseq_pipelines::cli::{parse_batch, BatchArgs};
use varseq_pipelines::config::defs::{PipelineError, BATCH_SUMMARY};
use varseq_pipelines::init_logging;
use varseq_pipelines::pipelines::aggregate::summarize;
use varseq_pipelines::pipelines::batch::{plan, Allocation, BatchScheduler};
use varseq_pipelines::pipelines::variant_calling::Pipeline;
use varseq_pipelines::utils::command::{check_versions, ProcessRunner, ToolRunner};
use varseq_pipelines::utils::reference::Reference;
use varseq_pipelines::utils::sample::discover;
use varseq_pipelines::utils::system::{detect_cores_and_load, is_heavily_loaded};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse_batch();
    init_logging(args.tools.verbose);

    println!("\n-------------\n VarSeq batch\n-------------\n");

    match run(args).await {
        Ok(true) => {
            println!("Batch complete: {} milliseconds.", run_start.elapsed().as_millis());
            Ok(())
        }
        Ok(false) => {
            error!("Batch finished with failed samples after {} milliseconds.", run_start.elapsed().as_millis());
            std::process::exit(1);
        }
        Err(e) => {
            error!("Batch aborted: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }
}

/// Plans, confirms and runs the batch.
///
/// # Returns
/// true when every sample succeeded.
async fn run(args: BatchArgs) -> Result<bool, PipelineError> {
    let samples = discover(&args.root, &args.pattern)?;
    let reference = Reference::new(&args.reference)?;
    let run_config = Arc::new(args.tools.run_config());
    run_config.validate()?;

    let (budget, cpu_load) = detect_cores_and_load(args.threads).await;
    debug!("Thread budget {}; CPU load {}%", budget, cpu_load);
    if is_heavily_loaded(cpu_load) {
        warn!("CPU load is already {:.0}%", cpu_load);
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();

    let strategy = match args.strategy()? {
        Some(strategy) => strategy,
        None => match choose_strategy(&mut input, &mut output, samples.len(), budget)? {
            Some(strategy) => strategy,
            None => {
                info!("Exit selected, nothing launched");
                return Ok(true);
            }
        },
    };

    let allocation = plan(samples.len(), budget, strategy)?;
    info!("Allocation: {}", allocation);
    let confirmed = args.yes || (allocation.is_oversubscribed() && confirm(&mut input, &mut output, &allocation)?);
    let approved = allocation.approve(confirmed)?;

    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner);
    if !args.tools.skip_tool_check {
        check_versions(runner.as_ref(), &run_config.environments.tool_contexts()).await?;
    }

    let scheduler = BatchScheduler::new(Arc::new(Pipeline::new(runner, run_config)));
    let batch = scheduler.execute(samples.clone(), &reference, &approved).await;

    let report = summarize(&batch, &samples);
    let summary_path = args.root.join(BATCH_SUMMARY);
    if let Err(e) = report.write(&summary_path) {
        warn!("Could not write {}: {}", summary_path.display(), e);
    }
    println!("\n{}", report.render());
    info!("Summary written to {}", summary_path.display());
    Ok(report.failed == 0)
}

fn confirm<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    allocation: &Allocation,
) -> Result<bool, PipelineError> {
    let accepted = confirm_oversubscription(input, output, allocation)?;
    if !accepted {
        warn!("Oversubscription declined; no samples launched");
    }
    Ok(accepted)
}
