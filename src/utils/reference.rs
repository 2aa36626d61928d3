//! Reference genome and its companion indexes.
//!
//! Index builds are serialized per index path inside this process: the first
//! worker to find an index missing builds it while the others wait, then see it
//! present. Separate processes sharing a reference are not coordinated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::{info, warn};
use crate::config::capability::CapabilityContext;
use crate::config::defs::{PipelineError, SamtoolsSubcommand, FASTA_EXTS, GZIP_EXT};
use crate::utils::command::samtools::SamtoolsConfig;
use crate::utils::command::{minimap2, samtools, ToolInvocation, ToolRunner};
use crate::utils::file::{is_non_empty_file, promote, with_added_extension};

lazy_static! {
    static ref INDEX_LOCKS: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>> = Mutex::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// minimap2 `.mmi`, needed for alignment.
    Minimap2,
    /// samtools `.fai`, needed for variant calling.
    Faidx,
}

impl IndexKind {
    pub fn extension(&self) -> &'static str {
        match self {
            IndexKind::Minimap2 => "mmi",
            IndexKind::Faidx => "fai",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub fasta: PathBuf,
}

impl Reference {
    pub fn new(path: &Path) -> Result<Reference, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::Usage(format!("Reference file not found: {}", path.display())));
        }
        let name = path.to_string_lossy().to_lowercase();
        let name = name.strip_suffix(&format!(".{}", GZIP_EXT)).unwrap_or(&name);
        if !FASTA_EXTS.iter().any(|ext| name.ends_with(&format!(".{}", ext))) {
            warn!("Reference {} does not have a FASTA extension", path.display());
        }
        Ok(Reference { fasta: path.canonicalize()? })
    }

    pub fn index_path(&self, kind: IndexKind) -> PathBuf {
        with_added_extension(&self.fasta, kind.extension())
    }

    pub fn has_index(&self, kind: IndexKind) -> bool {
        is_non_empty_file(&self.index_path(kind))
    }
}

fn index_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = INDEX_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

fn build_invocation(
    context: &CapabilityContext,
    reference: &Reference,
    kind: IndexKind,
    out: &Path,
    threads: usize,
) -> ToolInvocation {
    match kind {
        IndexKind::Minimap2 => minimap2::build_index(context, &reference.fasta, out, threads),
        IndexKind::Faidx => samtools::invocation(
            context,
            &SamtoolsConfig {
                subcommand: SamtoolsSubcommand::Faidx,
                input: &reference.fasta,
                output: Some(out),
                threads,
            },
        ),
    }
}

/// Makes sure a companion index exists, building it at most once per process.
///
/// # Arguments
///
/// * `runner` - ToolRunner for the build command.
/// * `context` - Capability providing the indexer.
/// * `reference` - Reference to index.
/// * `kind` - Which index.
/// * `threads` - Thread cap for the build.
///
/// # Returns
/// true if this call built the index, false if it was already there.
pub async fn ensure_index(
    runner: &dyn ToolRunner,
    context: &CapabilityContext,
    reference: &Reference,
    kind: IndexKind,
    threads: usize,
) -> Result<bool> {
    let index_path = reference.index_path(kind);
    if is_non_empty_file(&index_path) {
        return Ok(false);
    }

    let lock = index_lock(&index_path);
    let _guard = lock.lock().await;
    // Another worker may have finished while we waited
    if is_non_empty_file(&index_path) {
        return Ok(false);
    }

    let parent = index_path
        .parent()
        .ok_or_else(|| anyhow!("Reference has no parent directory: {}", reference.fasta.display()))?;
    let scratch = tempfile::Builder::new().prefix(".index-build").tempdir_in(parent)?;
    let file_name = index_path
        .file_name()
        .ok_or_else(|| anyhow!("Bad index path {}", index_path.display()))?;
    let scratch_out = scratch.path().join(file_name);

    info!("Building {} index for {}", kind.extension(), reference.fasta.display());
    let invocation = build_invocation(context, reference, kind, &scratch_out, threads);
    let outcome = runner.run(&invocation).await?;
    if !outcome.success {
        return Err(anyhow!(
            "Index build exited with {:?}: {}",
            outcome.exit_code,
            outcome.stderr.trim()
        ));
    }
    if !is_non_empty_file(&scratch_out) {
        return Err(anyhow!("Index build produced no {}", index_path.display()));
    }
    promote(&scratch_out, &index_path)?;
    Ok(true)
}
