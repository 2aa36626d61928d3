//! Tool capabilities and the environments that provide them.
//!
//! A stage never activates an environment globally. It receives a
//! `CapabilityContext` and asks it to wrap each command, so two samples
//! running different stages side by side cannot disturb each other.

use std::fmt;
use serde::Serialize;
use crate::config::defs::{BCFTOOLS_TAG, CLAIR3_TAG, FASTP_TAG, MINIMAP2_TAG, SAMTOOLS_TAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    /// Work done in-process; no external tool.
    Builtin,
    QcTools,
    AlignmentTools,
    VariantCaller,
}

impl Capability {
    pub fn label(&self) -> &'static str {
        match self {
            Capability::Builtin => "builtin",
            Capability::QcTools => "QC tools",
            Capability::AlignmentTools => "alignment/variant tools",
            Capability::VariantCaller => "variant caller",
        }
    }

    /// Executables this capability must provide.
    pub fn tools(&self) -> &'static [&'static str] {
        match self {
            Capability::Builtin => &[],
            Capability::QcTools => &[FASTP_TAG],
            Capability::AlignmentTools => &[MINIMAP2_TAG, SAMTOOLS_TAG, BCFTOOLS_TAG],
            Capability::VariantCaller => &[CLAIR3_TAG],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}


/// A capability bound to the environment that should run it.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityContext {
    pub capability: Capability,
    pub environment: Option<String>,
    pub launcher: String,
}

impl CapabilityContext {
    pub fn new(capability: Capability, environment: Option<String>, launcher: &str) -> Self {
        CapabilityContext {
            capability,
            environment,
            launcher: launcher.to_string(),
        }
    }

    /// Runs tools straight from PATH.
    pub fn bare(capability: Capability) -> Self {
        CapabilityContext::new(capability, None, DEFAULT_LAUNCHER)
    }

    /// Resolves the program and argument list to actually spawn.
    ///
    /// # Arguments
    ///
    /// * `tool` - Executable name, e.g. `samtools`.
    /// * `args` - Arguments for the tool.
    ///
    /// # Returns
    /// (program, args) with the environment launcher prepended when an environment is set.
    pub fn wrap(&self, tool: &str, args: &[String]) -> (String, Vec<String>) {
        match &self.environment {
            Some(env) => {
                let mut wrapped = vec![
                    "run".to_string(),
                    "--no-capture-output".to_string(),
                    "-n".to_string(),
                    env.clone(),
                    tool.to_string(),
                ];
                wrapped.extend(args.iter().cloned());
                (self.launcher.clone(), wrapped)
            }
            None => (tool.to_string(), args.to_vec()),
        }
    }
}

pub const DEFAULT_LAUNCHER: &str = "conda";


/// Environment names per capability, taken from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentMap {
    pub qc: Option<String>,
    pub alignment: Option<String>,
    pub caller: Option<String>,
    pub launcher: String,
}

impl Default for EnvironmentMap {
    fn default() -> Self {
        EnvironmentMap {
            qc: None,
            alignment: None,
            caller: None,
            launcher: DEFAULT_LAUNCHER.to_string(),
        }
    }
}

impl EnvironmentMap {
    pub fn context(&self, capability: Capability) -> CapabilityContext {
        let environment = match capability {
            Capability::Builtin => None,
            Capability::QcTools => self.qc.clone(),
            Capability::AlignmentTools => self.alignment.clone(),
            Capability::VariantCaller => self.caller.clone(),
        };
        CapabilityContext::new(capability, environment, &self.launcher)
    }

    /// Contexts of every capability that runs external tools.
    pub fn tool_contexts(&self) -> Vec<CapabilityContext> {
        [Capability::QcTools, Capability::AlignmentTools, Capability::VariantCaller]
            .into_iter()
            .map(|capability| self.context(capability))
            .collect()
    }
}
