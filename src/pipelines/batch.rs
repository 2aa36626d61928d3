//! Batch scheduling: split a fixed thread budget across samples, then run
//! their pipelines with bounded concurrency.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::future::join_all;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::Semaphore;
use crate::config::defs::PipelineError;
use crate::pipelines::variant_calling::{Pipeline, PipelineRun, RunStatus};
use crate::utils::file::append_to_file;
use crate::utils::reference::Reference;
use crate::utils::sample::Sample;

pub const WORKER_PANICKED: &str = "worker-panicked";


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    MaximumParallelism,
    Balanced,
    SpeedPriority,
    Custom { jobs: usize, threads_per_job: usize },
}

impl Strategy {
    /// Custom strategy; both values must be positive.
    pub fn custom(jobs: usize, threads_per_job: usize) -> Result<Strategy, PipelineError> {
        if jobs == 0 || threads_per_job == 0 {
            return Err(PipelineError::Usage(format!(
                "Custom strategy needs positive values, got {} jobs x {} threads",
                jobs, threads_per_job
            )));
        }
        Ok(Strategy::Custom { jobs, threads_per_job })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::MaximumParallelism => "maximum-parallelism",
            Strategy::Balanced => "balanced",
            Strategy::SpeedPriority => "speed-priority",
            Strategy::Custom { .. } => "custom",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}


/// Output of `plan`. Must be approved before anything runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub max_concurrent_jobs: usize,
    pub threads_per_job: usize,
    pub strategy: Strategy,
    pub budget: usize,
}

impl Allocation {
    pub fn requested_threads(&self) -> usize {
        self.max_concurrent_jobs.saturating_mul(self.threads_per_job)
    }

    pub fn is_oversubscribed(&self) -> bool {
        self.requested_threads() > self.budget
    }

    /// Turns a plan into something `execute` accepts. An oversubscribed plan
    /// passes only with `confirmed`.
    pub fn approve(self, confirmed: bool) -> Result<ApprovedAllocation, PipelineError> {
        if self.is_oversubscribed() {
            if !confirmed {
                return Err(PipelineError::Oversubscription {
                    requested: self.requested_threads(),
                    budget: self.budget,
                });
            }
            warn!(
                "Proceeding oversubscribed: {} jobs x {} threads = {} > budget {}",
                self.max_concurrent_jobs,
                self.threads_per_job,
                self.requested_threads(),
                self.budget
            );
        }
        Ok(ApprovedAllocation(self))
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} concurrent job(s) x {} thread(s) (budget {})",
            self.strategy, self.max_concurrent_jobs, self.threads_per_job, self.budget
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovedAllocation(Allocation);

impl ApprovedAllocation {
    pub fn allocation(&self) -> &Allocation {
        &self.0
    }
}


/// Computes concurrency and per-job threads. Remainder threads are left idle.
///
/// # Arguments
///
/// * `sample_count` - Number of samples to run.
/// * `budget` - Total thread budget.
/// * `strategy` - Selected strategy.
///
/// # Returns
/// Allocation, possibly oversubscribed.
pub fn plan(sample_count: usize, budget: usize, strategy: Strategy) -> Result<Allocation, PipelineError> {
    if sample_count == 0 {
        return Err(PipelineError::Usage("No samples to schedule".to_string()));
    }
    if budget == 0 {
        return Err(PipelineError::Usage("Thread budget must be at least 1".to_string()));
    }
    let (max_concurrent_jobs, threads_per_job) = match strategy {
        Strategy::MaximumParallelism => (sample_count, budget / sample_count),
        Strategy::Balanced => (3, budget / 3),
        Strategy::SpeedPriority => (2, budget / 2),
        Strategy::Custom { jobs, threads_per_job } => {
            if jobs == 0 || threads_per_job == 0 {
                return Err(PipelineError::Usage("Custom strategy needs positive values".to_string()));
            }
            (jobs, threads_per_job)
        }
    };
    let threads_per_job = if threads_per_job == 0 {
        warn!("Budget {} is too small for {} jobs; using 1 thread per job", budget, max_concurrent_jobs);
        1
    } else {
        threads_per_job
    };
    Ok(Allocation { max_concurrent_jobs, threads_per_job, strategy, budget })
}


/// Thread assignment for one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobAllocation {
    pub sample: String,
    pub threads: usize,
    pub strategy: String,
}

#[derive(Debug, Clone)]
pub enum SampleOutcome {
    Completed(PipelineRun),
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub sample: Sample,
    pub job: JobAllocation,
    pub outcome: SampleOutcome,
}

impl SampleRecord {
    pub fn is_success(&self) -> bool {
        matches!(&self.outcome, SampleOutcome::Completed(run) if run.is_success())
    }

    pub fn status_label(&self) -> String {
        match &self.outcome {
            SampleOutcome::Completed(run) => run.status.to_string(),
            SampleOutcome::Panicked(_) => WORKER_PANICKED.to_string(),
        }
    }

    /// Failing stage and reason code, if the sample failed.
    pub fn reason(&self) -> Option<String> {
        match &self.outcome {
            SampleOutcome::Completed(run) => match (&run.status, run.failure()) {
                (RunStatus::Succeeded, _) => None,
                (RunStatus::FailedAt(stage), Some(reason)) => Some(format!("{}: {}", stage, reason)),
                (RunStatus::FailedAt(stage), None) => Some(stage.to_string()),
                (RunStatus::AbortedUsageError(detail), _) => Some(format!("usage-error: {}", detail)),
            },
            SampleOutcome::Panicked(detail) => Some(format!("{}: {}", WORKER_PANICKED, detail)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub allocation: Allocation,
    pub records: Vec<SampleRecord>,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_ids: Vec<String>,
    pub elapsed: Duration,
}

impl BatchResult {
    fn assemble(allocation: Allocation, records: Vec<SampleRecord>, elapsed: Duration) -> Self {
        let failed_ids: Vec<String> = records
            .iter()
            .filter(|record| !record.is_success())
            .map(|record| record.sample.id.clone())
            .collect();
        BatchResult {
            allocation,
            succeeded: records.len() - failed_ids.len(),
            failed: failed_ids.len(),
            failed_ids,
            records,
            elapsed,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}


pub struct BatchScheduler {
    pipeline: Arc<Pipeline>,
}

impl BatchScheduler {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        BatchScheduler { pipeline }
    }

    /// Runs every sample, at most `max_concurrent_jobs` at a time, in
    /// submission order. A failing or panicking sample never stops the rest.
    pub async fn execute(&self, samples: Vec<Sample>, reference: &Reference, approved: &ApprovedAllocation) -> BatchResult {
        let allocation = *approved.allocation();
        let start = Instant::now();
        info!("Scheduling {} sample(s) with {}", samples.len(), allocation);

        let semaphore = Arc::new(Semaphore::new(allocation.max_concurrent_jobs));
        let mut launched = Vec::with_capacity(samples.len());
        let mut handles = Vec::with_capacity(samples.len());

        for sample in samples {
            let job = JobAllocation {
                sample: sample.id.clone(),
                threads: allocation.threads_per_job,
                strategy: allocation.strategy.to_string(),
            };
            batch_log(&sample, &format!(
                "[{}] queued with {} threads ({})",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                job.threads,
                allocation
            ));

            // Blocks until a slot frees up
            let handle = match semaphore.clone().acquire_owned().await {
                Ok(permit) => {
                    let pipeline = self.pipeline.clone();
                    let reference = reference.clone();
                    let task_sample = sample.clone();
                    let threads = job.threads;
                    Some(tokio::spawn(async move {
                        let _permit = permit;
                        info!("{}: started", task_sample.id);
                        pipeline.run(&task_sample, &reference, threads).await
                    }))
                }
                Err(e) => {
                    error!("{}: not launched, scheduler semaphore closed: {}", sample.id, e);
                    None
                }
            };
            launched.push((sample, job));
            handles.push(handle);
        }

        let outcomes = join_all(handles.into_iter().map(|handle| async move {
            match handle {
                Some(handle) => match handle.await {
                    Ok(run) => SampleOutcome::Completed(run),
                    Err(e) => SampleOutcome::Panicked(e.to_string()),
                },
                None => SampleOutcome::Panicked("never launched".to_string()),
            }
        }))
        .await;

        let mut records = Vec::with_capacity(outcomes.len());
        for ((sample, job), outcome) in launched.into_iter().zip(outcomes) {
            let record = SampleRecord { sample, job, outcome };
            log_record(&record);
            records.push(record);
        }

        let result = BatchResult::assemble(allocation, records, start.elapsed());
        info!(
            "Batch finished in {:.1}s: {} succeeded, {} failed",
            result.elapsed.as_secs_f64(),
            result.succeeded,
            result.failed
        );
        result
    }
}

fn batch_log(sample: &Sample, text: &str) {
    if let Err(e) = append_to_file(&sample.batch_log(), text) {
        warn!("{}: could not write batch log: {}", sample.id, e);
    }
}

fn log_record(record: &SampleRecord) {
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    match record.reason() {
        None => {
            info!("{}: {}", record.sample.id, record.status_label());
            batch_log(&record.sample, &format!("[{}] {}", stamp, record.status_label()));
        }
        Some(reason) => {
            error!("{}: {} ({})", record.sample.id, record.status_label(), reason);
            batch_log(&record.sample, &format!("[{}] FAILED {}", stamp, reason));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_for_128_threads() -> Result<(), PipelineError> {
        let balanced = plan(10, 128, Strategy::Balanced)?;
        assert_eq!((balanced.max_concurrent_jobs, balanced.threads_per_job), (3, 42));
        let speed = plan(10, 128, Strategy::SpeedPriority)?;
        assert_eq!((speed.max_concurrent_jobs, speed.threads_per_job), (2, 64));
        let max = plan(6, 128, Strategy::MaximumParallelism)?;
        assert_eq!((max.max_concurrent_jobs, max.threads_per_job), (6, 21));
        assert!(!balanced.is_oversubscribed());
        assert!(!max.is_oversubscribed());
        Ok(())
    }

    #[test]
    fn test_custom_oversubscription_needs_confirmation() -> Result<(), PipelineError> {
        let allocation = plan(4, 16, Strategy::custom(4, 8)?)?;
        assert!(allocation.is_oversubscribed());
        match allocation.approve(false) {
            Err(PipelineError::Oversubscription { requested, budget }) => {
                assert_eq!((requested, budget), (32, 16));
            }
            other => panic!("unexpected {:?}", other),
        }
        let approved = allocation.approve(true)?;
        assert_eq!(approved.allocation().threads_per_job, 8);
        Ok(())
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(matches!(plan(0, 8, Strategy::Balanced), Err(PipelineError::Usage(_))));
        assert!(matches!(plan(3, 0, Strategy::Balanced), Err(PipelineError::Usage(_))));
        assert!(matches!(Strategy::custom(0, 4), Err(PipelineError::Usage(_))));
        assert!(matches!(plan(2, 8, Strategy::Custom { jobs: 2, threads_per_job: 0 }), Err(PipelineError::Usage(_))));
    }

    #[test]
    fn test_tiny_budget_is_raised_then_gated() -> Result<(), PipelineError> {
        let allocation = plan(8, 4, Strategy::MaximumParallelism)?;
        assert_eq!(allocation.threads_per_job, 1);
        assert!(allocation.is_oversubscribed());
        assert!(allocation.approve(false).is_err());
        Ok(())
    }

    #[test]
    fn test_remainder_is_not_redistributed() -> Result<(), PipelineError> {
        let allocation = plan(5, 10, Strategy::Balanced)?;
        assert_eq!(allocation.threads_per_job, 3);
        assert_eq!(allocation.requested_threads(), 9);
        Ok(())
    }
}
