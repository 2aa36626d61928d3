use std::path::Path;
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TOTAL_RE: Regex = Regex::new(r"^(\d+) \+ (\d+) in total").unwrap();
    static ref MAPPED_RE: Regex = Regex::new(r"^(\d+) \+ (\d+) mapped \(([0-9.]+|N/A)%?").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlagstatSummary {
    pub total_reads: u64,
    pub mapped_reads: u64,
    /// Percent of reads mapped, as samtools reports it.
    pub alignment_rate: f64,
}

/// Parses `samtools flagstat` text output.
///
/// # Arguments
///
/// * `text` - Full flagstat report.
///
/// # Returns
/// FlagstatSummary, or an error if the total or mapped line is missing.
pub fn parse_flagstat(text: &str) -> Result<FlagstatSummary> {
    let mut total: Option<u64> = None;
    let mut mapped: Option<(u64, Option<f64>)> = None;

    for line in text.lines().map(str::trim) {
        if total.is_none() {
            if let Some(caps) = TOTAL_RE.captures(line) {
                total = Some(caps[1].parse::<u64>()? + caps[2].parse::<u64>()?);
                continue;
            }
        }
        // "primary mapped" also exists; the first plain "mapped" line wins
        if mapped.is_none() {
            if let Some(caps) = MAPPED_RE.captures(line) {
                let count = caps[1].parse::<u64>()? + caps[2].parse::<u64>()?;
                mapped = Some((count, caps[3].parse::<f64>().ok()));
            }
        }
    }

    let total_reads = total.ok_or_else(|| anyhow!("flagstat report has no total line"))?;
    let (mapped_reads, reported) = mapped.ok_or_else(|| anyhow!("flagstat report has no mapped line"))?;
    let alignment_rate = match reported {
        Some(rate) => rate,
        None if total_reads == 0 => 0.0,
        None => mapped_reads as f64 * 100.0 / total_reads as f64,
    };
    Ok(FlagstatSummary { total_reads, mapped_reads, alignment_rate })
}

pub fn read_flagstat(path: &Path) -> Result<FlagstatSummary> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
    parse_flagstat(&text)
}
