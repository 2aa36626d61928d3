//! One pipeline stage and the runner that executes it for one sample.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::Serialize;
use crate::config::capability::{Capability, CapabilityContext};
use crate::config::defs::STAGING_DIR;
use crate::utils::command::{ToolInvocation, ToolRunner};
use crate::utils::file::{append_to_file, concatenate_gzip, is_non_empty_file, promote, reset_dir, staged_path};
use crate::utils::reference::{ensure_index, IndexKind, Reference};
use crate::utils::sample::Sample;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    CombineInputs,
    QualityFilter,
    AlignToReference,
    CallVariants,
    FilterVariants,
    SummarizeStatistics,
}

impl StageName {
    pub const ORDER: [StageName; 6] = [
        StageName::CombineInputs,
        StageName::QualityFilter,
        StageName::AlignToReference,
        StageName::CallVariants,
        StageName::FilterVariants,
        StageName::SummarizeStatistics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::CombineInputs => "combine-inputs",
            StageName::QualityFilter => "quality-filter",
            StageName::AlignToReference => "align-to-reference",
            StageName::CallVariants => "call-variants",
            StageName::FilterVariants => "filter-variants",
            StageName::SummarizeStatistics => "summarize-statistics",
        }
    }

    pub fn ordinal(&self) -> usize {
        Self::ORDER.iter().position(|s| s == self).unwrap_or(0)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


/// Reason codes carried by a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    MissingInput,
    IndexUnavailable,
    ToolExit,
    ToolSpawn,
    OutputValidation,
    Io,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::MissingInput => "missing-input",
            ReasonCode::IndexUnavailable => "index-unavailable",
            ReasonCode::ToolExit => "tool-exit",
            ReasonCode::ToolSpawn => "tool-spawn",
            ReasonCode::OutputValidation => "output-validation",
            ReasonCode::Io => "io",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReason {
    pub code: ReasonCode,
    pub detail: String,
}

impl FailureReason {
    pub fn new(code: ReasonCode, detail: impl Into<String>) -> Self {
        FailureReason { code, detail: detail.into() }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StageStatus {
    Succeeded,
    Skipped,
    Failed(FailureReason),
}

impl StageStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, StageStatus::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: StageName,
    pub status: StageStatus,
    pub artifacts: Vec<PathBuf>,
    pub log: PathBuf,
    pub duration: Duration,
    pub note: Option<String>,
}


/// A unit of work inside a stage. Tool steps run external commands; the rest
/// run in-process.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Tool(ToolInvocation),
    Concatenate { inputs: Vec<PathBuf>, output: PathBuf },
    Copy { from: PathBuf, to: PathBuf },
    Move { from: PathBuf, to: PathBuf },
    WriteText { path: PathBuf, contents: String },
}

#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    pub steps: Vec<Step>,
    pub note: Option<String>,
}

/// Where a stage may write, and how many threads it may use.
#[derive(Debug, Clone)]
pub struct StageIo {
    pub base: PathBuf,
    pub staging: PathBuf,
    pub threads: usize,
}

impl StageIo {
    pub fn staged(&self, final_path: &Path) -> PathBuf {
        staged_path(&self.base, &self.staging, final_path)
    }
}

pub type CommandTemplate = Box<dyn Fn(&StageIo, &CapabilityContext) -> Result<StagePlan> + Send + Sync>;

pub struct Stage {
    pub name: StageName,
    pub capability: Capability,
    pub inputs: Vec<PathBuf>,
    /// Final artifact first. It is promoted last, so its presence means the
    /// whole stage completed.
    pub outputs: Vec<PathBuf>,
    pub index: Option<IndexKind>,
    pub threads: usize,
    pub template: CommandTemplate,
}

impl Stage {
    pub fn final_artifact(&self) -> Option<&Path> {
        self.outputs.first().map(PathBuf::as_path)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("index", &self.index)
            .field("threads", &self.threads)
            .finish()
    }
}


pub struct StageRunner {
    runner: Arc<dyn ToolRunner>,
    reference: Reference,
    /// Capability the indexers (minimap2, samtools) run under.
    index_context: CapabilityContext,
}

impl StageRunner {
    pub fn new(runner: Arc<dyn ToolRunner>, reference: Reference) -> Self {
        StageRunner { runner, reference, index_context: CapabilityContext::bare(Capability::AlignmentTools) }
    }

    pub fn with_index_context(mut self, index_context: CapabilityContext) -> Self {
        self.index_context = index_context;
        self
    }

    fn log(&self, sample: &Sample, text: &str) {
        if let Err(e) = append_to_file(&sample.pipeline_log(), text) {
            warn!("{}: could not write pipeline log: {}", sample.id, e);
        }
    }

    fn finish(
        &self,
        stage: &Stage,
        sample: &Sample,
        status: StageStatus,
        duration: Duration,
        note: Option<String>,
    ) -> StageResult {
        let outcome = match &status {
            StageStatus::Succeeded => "succeeded".to_string(),
            StageStatus::Skipped => "skipped (output already present)".to_string(),
            StageStatus::Failed(reason) => format!("FAILED {}", reason),
        };
        self.log(sample, &format!("{} {} in {:.1}s", stage.name, outcome, duration.as_secs_f64()));
        if let Some(note) = &note {
            self.log(sample, &format!("note: {}", note));
        }
        let artifacts = match status {
            StageStatus::Failed(_) => Vec::new(),
            _ => stage.outputs.clone(),
        };
        StageResult {
            stage: stage.name,
            status,
            artifacts,
            log: sample.pipeline_log(),
            duration,
            note,
        }
    }

    fn fail(&self, stage: &Stage, sample: &Sample, code: ReasonCode, detail: String, started: Option<Instant>) -> StageResult {
        warn!("{}: {} failed [{}] {}", sample.id, stage.name, code.as_str(), detail);
        let duration = started.map(|s| s.elapsed()).unwrap_or_default();
        self.finish(stage, sample, StageStatus::Failed(FailureReason::new(code, detail)), duration, None)
    }

    /// Executes one stage for one sample.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage definition with declared inputs and outputs.
    /// * `sample` - Sample being processed.
    /// * `context` - Capability the stage's tools must run under.
    ///
    /// # Returns
    /// StageResult. Failures are values, never errors.
    pub async fn run(&self, stage: &Stage, sample: &Sample, context: &CapabilityContext) -> StageResult {
        self.log(
            sample,
            &format!("=== {} ({}) ===", stage.name, chrono::Local::now().format("%Y-%m-%d %H:%M:%S")),
        );

        if let Some(final_artifact) = stage.final_artifact() {
            if is_non_empty_file(final_artifact) {
                info!("{}: {} already complete, skipping", sample.id, stage.name);
                return self.finish(stage, sample, StageStatus::Skipped, Duration::ZERO, None);
            }
        }

        let missing: Vec<String> = stage
            .inputs
            .iter()
            .filter(|path| !path.exists())
            .map(|path| path.display().to_string())
            .collect();
        if !missing.is_empty() {
            return self.fail(stage, sample, ReasonCode::MissingInput, format!("missing input(s): {}", missing.join(", ")), None);
        }

        // One remediation attempt, kept out of the stage timing
        if let Some(kind) = stage.index {
            if !self.reference.has_index(kind) {
                self.log(sample, &format!("building missing .{} index for {}", kind.extension(), self.reference.fasta.display()));
                if let Err(e) = ensure_index(self.runner.as_ref(), &self.index_context, &self.reference, kind, stage.threads).await {
                    return self.fail(stage, sample, ReasonCode::IndexUnavailable, e.to_string(), None);
                }
                if !self.reference.has_index(kind) {
                    let detail = format!("{} still missing after rebuild", self.reference.index_path(kind).display());
                    return self.fail(stage, sample, ReasonCode::IndexUnavailable, detail, None);
                }
            }
        }

        let started = Instant::now();
        info!("{}: starting {} with {} threads ({})", sample.id, stage.name, stage.threads, context.capability);

        let io = StageIo {
            base: sample.output_dir.clone(),
            staging: sample.output_dir.join(STAGING_DIR).join(stage.name.as_str()),
            threads: stage.threads,
        };
        if let Err(e) = reset_dir(&io.staging) {
            return self.fail(stage, sample, ReasonCode::Io, format!("cannot prepare staging dir: {}", e), Some(started));
        }

        let plan = match (stage.template)(&io, context) {
            Ok(plan) => plan,
            Err(e) => return self.fail(stage, sample, ReasonCode::Io, e.to_string(), Some(started)),
        };

        for step in &plan.steps {
            if let Err((code, detail)) = self.execute_step(sample, step).await {
                return self.fail(stage, sample, code, detail, Some(started));
            }
        }

        for output in &stage.outputs {
            let staged = io.staged(output);
            if !is_non_empty_file(&staged) {
                let detail = format!("{} missing or empty", output.display());
                return self.fail(stage, sample, ReasonCode::OutputValidation, detail, Some(started));
            }
        }

        // Final artifact goes last
        let promote_order = stage.outputs.iter().skip(1).chain(stage.outputs.first());
        for output in promote_order {
            if let Err(e) = promote(&io.staged(output), output) {
                return self.fail(stage, sample, ReasonCode::Io, e.to_string(), Some(started));
            }
        }
        if let Err(e) = fs::remove_dir_all(&io.staging) {
            debug!("{}: could not remove {}: {}", sample.id, io.staging.display(), e);
        }
        // Only succeeds once no other stage has staging content left
        if let Some(parent) = io.staging.parent() {
            let _ = fs::remove_dir(parent);
        }

        self.finish(stage, sample, StageStatus::Succeeded, started.elapsed(), plan.note)
    }

    async fn execute_step(&self, sample: &Sample, step: &Step) -> Result<(), (ReasonCode, String)> {
        match step {
            Step::Tool(invocation) => {
                self.log(sample, &format!("$ {}", invocation));
                let outcome = self
                    .runner
                    .run(invocation)
                    .await
                    .map_err(|e| (ReasonCode::ToolSpawn, e.to_string()))?;
                if !outcome.stderr.trim().is_empty() {
                    self.log(sample, outcome.stderr.trim_end());
                }
                if invocation.stdout_to.is_none() && !outcome.stdout.trim().is_empty() {
                    self.log(sample, outcome.stdout.trim_end());
                }
                if !outcome.success {
                    let code = outcome
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    return Err((ReasonCode::ToolExit, format!("{} exited with {}", invocation.tool, code)));
                }
                Ok(())
            }
            Step::Concatenate { inputs, output } => {
                let bytes = concatenate_gzip(inputs, output).map_err(|e| (ReasonCode::Io, e.to_string()))?;
                self.log(sample, &format!("combined {} file(s), {} bytes -> {}", inputs.len(), bytes, output.display()));
                Ok(())
            }
            Step::Copy { from, to } => {
                copy_into(from, to).map_err(|e| (ReasonCode::Io, e.to_string()))?;
                self.log(sample, &format!("copied {} -> {}", from.display(), to.display()));
                Ok(())
            }
            Step::Move { from, to } => {
                promote(from, to).map_err(|e| (ReasonCode::Io, e.to_string()))?;
                self.log(sample, &format!("moved {} -> {}", from.display(), to.display()));
                Ok(())
            }
            Step::WriteText { path, contents } => {
                write_into(path, contents).map_err(|e| (ReasonCode::Io, e.to_string()))?;
                self.log(sample, &format!("wrote {}", path.display()));
                Ok(())
            }
        }
    }
}

fn copy_into(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to).map_err(|e| anyhow!("Failed to copy {}: {}", from.display(), e))?;
    Ok(())
}

fn write_into(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}
