/// Functions and structs for building and running external tool commands

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;
use crate::config::capability::CapabilityContext;
use crate::config::defs::PipelineError;


/// One external command, already wrapped for its capability.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub program: String,
    pub args: Vec<String>,
    /// File that receives the tool's stdout, for tools that only write there.
    pub stdout_to: Option<PathBuf>,
    /// Files the command is expected to create.
    pub produces: Vec<PathBuf>,
}

impl ToolInvocation {
    pub fn new(context: &CapabilityContext, tool: &str, args: Vec<String>) -> Self {
        let (program, args) = context.wrap(tool, &args);
        ToolInvocation {
            tool: tool.to_string(),
            program,
            args,
            stdout_to: None,
            produces: Vec::new(),
        }
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout_to = Some(path.to_path_buf());
        self.produces.push(path.to_path_buf());
        self
    }

    pub fn produces(mut self, path: &Path) -> Self {
        self.produces.push(path.to_path_buf());
        self
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))?;
        if let Some(out) = &self.stdout_to {
            write!(f, " > {}", out.display())?;
        }
        Ok(())
    }
}


#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Empty when stdout was redirected to a file.
    pub stdout: String,
    pub stderr: String,
}


/// Seam between stages and the operating system.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the command to completion. `Err` means it could not be started at all.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome>;
}

/// Spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
        debug!("Spawning: {}", invocation);
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped());

        match &invocation.stdout_to {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        // output() would re-pipe stdout, so wait on the spawned child instead
        let child = cmd
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", invocation.program, e, invocation.tool))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| anyhow!("Failed waiting on {}: {}", invocation.program, e))?;

        Ok(ToolOutcome {
            exit_code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}


fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub mod fastp {
    use std::path::Path;
    use crate::config::capability::CapabilityContext;
    use crate::config::defs::{RunConfig, FASTP_MAX_THREADS, FASTP_TAG};
    use super::{path_arg, ToolInvocation};

    pub struct FastpConfig<'a> {
        pub input: &'a Path,
        pub output: &'a Path,
        pub html_report: &'a Path,
        pub json_report: &'a Path,
        pub threads: usize,
    }

    pub fn arg_generator(run_config: &RunConfig, fastp_config: &FastpConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-i".to_string());
        args_vec.push(path_arg(fastp_config.input));
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(fastp_config.output));
        args_vec.push("-q".to_string());
        args_vec.push(run_config.min_quality.to_string());
        args_vec.push("-l".to_string());
        args_vec.push(run_config.min_length.to_string());
        args_vec.push("-w".to_string());
        args_vec.push(fastp_config.threads.clamp(1, FASTP_MAX_THREADS).to_string());
        args_vec.push("-h".to_string());
        args_vec.push(path_arg(fastp_config.html_report));
        args_vec.push("-j".to_string());
        args_vec.push(path_arg(fastp_config.json_report));
        args_vec
    }

    pub fn invocation(context: &CapabilityContext, run_config: &RunConfig, fastp_config: &FastpConfig) -> ToolInvocation {
        ToolInvocation::new(context, FASTP_TAG, arg_generator(run_config, fastp_config))
            .produces(fastp_config.output)
            .produces(fastp_config.html_report)
            .produces(fastp_config.json_report)
    }
}

pub mod minimap2 {
    use std::path::Path;
    use crate::config::capability::CapabilityContext;
    use crate::config::defs::MINIMAP2_TAG;
    use super::{path_arg, ToolInvocation};

    /// Long-read alignment to SAM on stdout.
    pub fn align(context: &CapabilityContext, index: &Path, reads: &Path, sam_out: &Path, threads: usize) -> ToolInvocation {
        let args = vec![
            "-t".to_string(),
            threads.max(1).to_string(),
            "-ax".to_string(),
            "map-ont".to_string(),
            path_arg(index),
            path_arg(reads),
        ];
        ToolInvocation::new(context, MINIMAP2_TAG, args).stdout_to(sam_out)
    }

    pub fn build_index(context: &CapabilityContext, reference: &Path, index_out: &Path, threads: usize) -> ToolInvocation {
        let args = vec![
            "-t".to_string(),
            threads.max(1).to_string(),
            "-d".to_string(),
            path_arg(index_out),
            path_arg(reference),
        ];
        ToolInvocation::new(context, MINIMAP2_TAG, args).produces(index_out)
    }
}

pub mod samtools {
    use std::path::Path;
    use crate::config::capability::CapabilityContext;
    use crate::config::defs::{SamtoolsSubcommand, SAMTOOLS_TAG};
    use super::{path_arg, ToolInvocation};

    pub struct SamtoolsConfig<'a> {
        pub subcommand: SamtoolsSubcommand,
        pub input: &'a Path,
        pub output: Option<&'a Path>,
        pub threads: usize,
    }

    pub fn arg_generator(config: &SamtoolsConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match config.subcommand {
            SamtoolsSubcommand::Sort => {
                args_vec.push("sort".to_string());
                // -@ counts threads beyond the main one
                args_vec.push("-@".to_string());
                args_vec.push(config.threads.saturating_sub(1).to_string());
                if let Some(out) = config.output {
                    args_vec.push("-o".to_string());
                    args_vec.push(path_arg(out));
                }
                args_vec.push(path_arg(config.input));
            }
            SamtoolsSubcommand::Index => {
                args_vec.push("index".to_string());
                args_vec.push("-@".to_string());
                args_vec.push(config.threads.max(1).to_string());
                args_vec.push(path_arg(config.input));
                if let Some(out) = config.output {
                    args_vec.push(path_arg(out));
                }
            }
            SamtoolsSubcommand::Flagstat => {
                args_vec.push("flagstat".to_string());
                args_vec.push("-@".to_string());
                args_vec.push(config.threads.max(1).to_string());
                args_vec.push(path_arg(config.input));
            }
            SamtoolsSubcommand::Faidx => {
                args_vec.push("faidx".to_string());
                args_vec.push(path_arg(config.input));
                if let Some(out) = config.output {
                    args_vec.push("--fai-idx".to_string());
                    args_vec.push(path_arg(out));
                }
            }
        }
        args_vec
    }

    pub fn invocation(context: &CapabilityContext, config: &SamtoolsConfig) -> ToolInvocation {
        let invocation = ToolInvocation::new(context, SAMTOOLS_TAG, arg_generator(config));
        match (config.subcommand, config.output) {
            // flagstat only reports on stdout
            (SamtoolsSubcommand::Flagstat, Some(out)) => invocation.stdout_to(out),
            (_, Some(out)) => invocation.produces(out),
            (_, None) => invocation,
        }
    }
}

pub mod bcftools {
    use std::path::Path;
    use crate::config::capability::CapabilityContext;
    use crate::config::defs::{BcftoolsSubcommand, BCFTOOLS_TAG};
    use super::{path_arg, ToolInvocation};

    pub struct BcftoolsConfig<'a> {
        pub subcommand: BcftoolsSubcommand,
        pub input: &'a Path,
        pub output: &'a Path,
        pub threads: usize,
        pub min_quality: Option<u32>,
    }

    pub fn arg_generator(config: &BcftoolsConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match config.subcommand {
            BcftoolsSubcommand::View => {
                args_vec.push("view".to_string());
                args_vec.push("--threads".to_string());
                args_vec.push(config.threads.max(1).to_string());
                args_vec.push("-f".to_string());
                args_vec.push("PASS".to_string());
                if let Some(qual) = config.min_quality {
                    args_vec.push("-i".to_string());
                    args_vec.push(format!("QUAL>={}", qual));
                }
                args_vec.push("-Oz".to_string());
                args_vec.push("-o".to_string());
                args_vec.push(path_arg(config.output));
                args_vec.push(path_arg(config.input));
            }
            BcftoolsSubcommand::Index => {
                args_vec.push("index".to_string());
                args_vec.push("--threads".to_string());
                args_vec.push(config.threads.max(1).to_string());
                args_vec.push("-t".to_string());
                args_vec.push("-o".to_string());
                args_vec.push(path_arg(config.output));
                args_vec.push(path_arg(config.input));
            }
        }
        args_vec
    }

    pub fn invocation(context: &CapabilityContext, config: &BcftoolsConfig) -> ToolInvocation {
        ToolInvocation::new(context, BCFTOOLS_TAG, arg_generator(config)).produces(config.output)
    }
}

pub mod clair3 {
    use std::path::Path;
    use crate::config::capability::CapabilityContext;
    use crate::config::defs::{RunConfig, CLAIR3_MERGED_VCF, CLAIR3_TAG, VCF_INDEX_EXT};
    use crate::utils::file::with_added_extension;
    use super::{path_arg, ToolInvocation};

    pub fn invocation(
        context: &CapabilityContext,
        run_config: &RunConfig,
        bam: &Path,
        reference: &Path,
        output_dir: &Path,
        threads: usize,
    ) -> ToolInvocation {
        let mut args = vec![
            format!("--bam_fn={}", path_arg(bam)),
            format!("--ref_fn={}", path_arg(reference)),
            format!("--threads={}", threads.max(1)),
            format!("--platform={}", run_config.clair3_platform),
            format!("--output={}", path_arg(output_dir)),
        ];
        // RunConfig::validate rejects a missing model before any sample starts
        if let Some(model) = &run_config.clair3_model {
            args.push(format!("--model_path={}", path_arg(model)));
        }
        let merged = output_dir.join(CLAIR3_MERGED_VCF);
        let merged_index = with_added_extension(&merged, VCF_INDEX_EXT);
        ToolInvocation::new(context, CLAIR3_TAG, args)
            .produces(&merged)
            .produces(&merged_index)
    }
}


/// Probes one tool inside its capability and returns the reported version.
///
/// # Arguments
///
/// * `runner` - ToolRunner used for the probe.
/// * `context` - Capability the tool belongs to.
/// * `tool` - Tool tag.
///
/// # Returns
/// First line of the tool's version output.
pub async fn check_version(runner: &dyn ToolRunner, context: &CapabilityContext, tool: &str) -> Result<String> {
    let invocation = ToolInvocation::new(context, tool, vec!["--version".to_string()]);
    let outcome = runner.run(&invocation).await?;
    if !outcome.success {
        return Err(anyhow!("{} --version exited with {:?} under {}", tool, outcome.exit_code, context.capability));
    }
    // fastp reports on stderr, most others on stdout
    let version = outcome
        .stdout
        .lines()
        .chain(outcome.stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("No output from {} --version", tool))?
        .to_string();
    Ok(version)
}

/// Confirms every tool of every given capability can be launched.
pub async fn check_versions(runner: &dyn ToolRunner, contexts: &[CapabilityContext]) -> Result<(), PipelineError> {
    for context in contexts {
        for tool in context.capability.tools() {
            let version = check_version(runner, context, tool)
                .await
                .map_err(|e| PipelineError::Usage(format!("{} unavailable for {}: {}", tool, context.capability, e)))?;
            info!("{} ({}): {}", tool, context.capability, version);
        }
    }
    Ok(())
}
