//! Sample directories and their discovery under a batch root.

use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use crate::config::defs::{PipelineError, ANALYSIS_DIR, BATCH_LOG_SUFFIX, FASTQ_EXTS, GZIP_EXT, PIPELINE_LOG_SUFFIX};


/// One sample directory. Built once at discovery time and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub id: String,
    pub root: PathBuf,
    pub reads: Vec<PathBuf>,
    pub output_dir: PathBuf,
}

impl Sample {
    /// Reads a sample directory. Missing read files are not an error here;
    /// the pipeline reports them as a usage failure.
    pub fn from_dir(root: &Path) -> Result<Sample, PipelineError> {
        if !root.is_dir() {
            return Err(PipelineError::Usage(format!("Sample directory not found: {}", root.display())));
        }
        let root = root.canonicalize()?;
        let id = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::Usage(format!("Cannot derive a sample name from {}", root.display())))?;

        let mut reads: Vec<PathBuf> = fs::read_dir(&root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_read_file(path))
            .collect();
        reads.sort();

        let output_dir = root.join(ANALYSIS_DIR);
        Ok(Sample { id, root, reads, output_dir })
    }

    /// Deterministic artifact path: `<output_dir>/<id>_<suffix>`.
    pub fn artifact(&self, suffix: &str) -> PathBuf {
        self.output_dir.join(format!("{}_{}", self.id, suffix))
    }

    /// Artifact inside a sub-directory of the output directory.
    pub fn nested_artifact(&self, subdir: &str, suffix: &str) -> PathBuf {
        self.output_dir.join(subdir).join(format!("{}_{}", self.id, suffix))
    }

    pub fn pipeline_log(&self) -> PathBuf {
        self.artifact(PIPELINE_LOG_SUFFIX)
    }

    /// Batch driver log, kept beside the reads rather than in the output dir.
    pub fn batch_log(&self) -> PathBuf {
        self.root.join(format!("{}_{}", self.id, BATCH_LOG_SUFFIX))
    }
}

/// `*.fastq`, `*.fq`, and their gzipped forms.
pub fn is_read_file(path: &Path) -> bool {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().to_lowercase(),
        None => return false,
    };
    let name = name
        .strip_suffix(&format!(".{}", GZIP_EXT))
        .unwrap_or(&name);
    FASTQ_EXTS.iter().any(|ext| name.ends_with(&format!(".{}", ext)))
}


/// Finds sample directories under `root` whose names match `pattern`.
///
/// # Arguments
///
/// * `root` - Directory holding one sub-directory per sample.
/// * `pattern` - Regular expression matched against directory names.
///
/// # Returns
/// Samples ordered by directory name; a usage error when none match.
pub fn discover(root: &Path, pattern: &str) -> Result<Vec<Sample>, PipelineError> {
    if !root.is_dir() {
        return Err(PipelineError::Usage(format!("Root directory not found: {}", root.display())));
    }
    let name_re = Regex::new(pattern)
        .map_err(|e| PipelineError::Usage(format!("Invalid sample pattern '{}': {}", pattern, e)))?;

    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .map(|name| name_re.is_match(&name.to_string_lossy()))
                .unwrap_or(false)
        })
        .collect();
    dirs.sort();

    if dirs.is_empty() {
        return Err(PipelineError::Usage(format!(
            "No sample directories matching '{}' under {}",
            pattern,
            root.display()
        )));
    }

    let mut samples = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let sample = Sample::from_dir(&dir)?;
        if sample.reads.is_empty() {
            warn!("Sample {} has no read files", sample.id);
        } else {
            debug!("Sample {}: {} read files", sample.id, sample.reads.len());
        }
        samples.push(sample);
    }
    Ok(samples)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::DEFAULT_SAMPLE_PATTERN;
    use tempfile::tempdir;

    #[test]
    fn test_is_read_file() {
        assert!(is_read_file(Path::new("a.fastq.gz")));
        assert!(is_read_file(Path::new("a.FQ")));
        assert!(is_read_file(Path::new("dir/a.fq.gz")));
        assert!(!is_read_file(Path::new("a.fasta")));
        assert!(!is_read_file(Path::new("a.gz")));
    }

    #[test]
    fn test_discover_filters_and_orders() -> anyhow::Result<()> {
        let root = tempdir()?;
        for name in ["barcode10", "barcode02", "unclassified", "barcodeX"] {
            fs::create_dir(root.path().join(name))?;
        }
        fs::write(root.path().join("barcode02/chunk_1.fastq.gz"), b"x")?;
        fs::write(root.path().join("barcode02/chunk_0.fastq.gz"), b"x")?;
        fs::write(root.path().join("barcode02/notes.txt"), b"x")?;
        fs::write(root.path().join("barcode07"), b"a file, not a dir")?;

        let samples = discover(root.path(), DEFAULT_SAMPLE_PATTERN)?;
        let ids: Vec<&str> = samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["barcode02", "barcode10"]);

        let first = &samples[0];
        assert_eq!(first.reads.len(), 2);
        assert!(first.reads[0].ends_with("chunk_0.fastq.gz"));
        assert!(first.output_dir.ends_with("barcode02/analysis_output"));
        assert!(samples[1].reads.is_empty());
        Ok(())
    }

    #[test]
    fn test_discover_none_is_usage_error() -> anyhow::Result<()> {
        let root = tempdir()?;
        fs::create_dir(root.path().join("sampleA"))?;
        let err = discover(root.path(), DEFAULT_SAMPLE_PATTERN).unwrap_err();
        assert!(matches!(err, PipelineError::Usage(_)));
        Ok(())
    }

    #[test]
    fn test_artifact_paths_are_deterministic() -> anyhow::Result<()> {
        let root = tempdir()?;
        let dir = root.path().join("barcode01");
        fs::create_dir(&dir)?;
        let a = Sample::from_dir(&dir)?;
        let b = Sample::from_dir(&dir)?;
        assert_eq!(a.artifact("sorted.bam"), b.artifact("sorted.bam"));
        assert!(a.artifact("sorted.bam").ends_with("analysis_output/barcode01_sorted.bam"));
        assert!(a.batch_log().ends_with("barcode01/barcode01_batch.log"));
        Ok(())
    }
}
