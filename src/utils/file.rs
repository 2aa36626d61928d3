use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use anyhow::{anyhow, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// True when the path is a regular file with at least one byte.
pub fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// `a.bam` + `bai` -> `a.bam.bai`
pub fn with_added_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

/// Maps a final artifact path to its location inside a staging directory,
/// keeping any sub-directory below `base`.
///
/// # Arguments
///
/// * `base` - Directory the final artifacts live under.
/// * `staging` - Staging directory for the current stage.
/// * `final_path` - Final artifact path.
///
/// # Returns
/// Staged path.
pub fn staged_path(base: &Path, staging: &Path, final_path: &Path) -> PathBuf {
    match final_path.strip_prefix(base) {
        Ok(relative) => staging.join(relative),
        Err(_) => staging.join(final_path.file_name().unwrap_or(final_path.as_os_str())),
    }
}

/// Moves a validated staged file into its final place. Both paths are expected
/// on the same filesystem so the rename is atomic.
pub fn promote(staged: &Path, final_path: &Path) -> Result<()> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(staged, final_path)
        .map_err(|e| anyhow!("Failed to move {} to {}: {}", staged.display(), final_path.display(), e))
}

/// Removes and recreates a directory.
pub fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Appends text to a log file, creating it if needed.
pub fn append_to_file(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        writeln!(file)?;
    }
    Ok(())
}

/// Concatenates read files in order into one gzip stream. Gzipped inputs are
/// copied as-is, plain inputs are compressed into their own member.
///
/// # Arguments
///
/// * `inputs` - Files in the order they should appear.
/// * `output` - Destination; parent directories are created.
///
/// # Returns
/// Bytes written.
pub fn concatenate_gzip(inputs: &[PathBuf], output: &Path) -> Result<u64> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(output)?;
    for input in inputs {
        let mut file = File::open(input)
            .map_err(|e| anyhow!("Failed to open {}: {}", input.display(), e))?;
        if is_gzipped(input)? {
            io::copy(&mut file, &mut out)?;
        } else {
            let mut encoder = GzEncoder::new(&mut out, Compression::default());
            io::copy(&mut file, &mut encoder)?;
            encoder.finish()?;
        }
    }
    out.flush()?;
    Ok(out.metadata()?.len())
}
