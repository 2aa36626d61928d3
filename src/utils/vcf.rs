use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use anyhow::{anyhow, Result};
use flate2::read::MultiGzDecoder;
use crate::utils::file::is_gzipped;


#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct VariantCounts {
    pub records: u64,
    pub snps: u64,
    pub mnps: u64,
    pub indels: u64,
}

impl VariantCounts {
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

fn vcf_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| anyhow!("Failed to open VCF {}: {}", path.display(), e))?;
    // BGZF is multi-member gzip
    let inner: Box<dyn Read> = if is_gzipped(path)? {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(inner)))
}

/// Compute allele counts from a VCF file, plain or bgzipped.
///
/// # Arguments
///
/// * `path` - VCF file.
///
/// # Returns
///
/// VariantCounts with the number of data records and their SNP/MNP/indel split.
pub fn count_variants(path: &Path) -> Result<VariantCounts> {
    let mut counts = VariantCounts::default();
    for line in vcf_reader(path)?.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').collect();
        if fields.len() < 5 {
            return Err(anyhow!(
                "Invalid VCF line format: expected at least 5 fields, found {} in line: '{}'",
                fields.len(),
                line
            ));
        }
        counts.records += 1;
        let ref_allele = fields[3];
        let alts: Vec<&str> = fields[4].split(',').filter(|a| *a != "." && *a != "*").collect();
        if alts.is_empty() {
            continue;
        }
        // Symbolic alleles (<DEL>, <INS>, breakends) are structural, never SNPs
        if alts.iter().any(|a| a.starts_with('<') || a.contains('[') || a.contains(']')) {
            counts.indels += 1;
            continue;
        }
        let allele_lens: HashSet<usize> = std::iter::once(ref_allele.len())
            .chain(alts.iter().map(|a| a.len()))
            .collect();
        if allele_lens.len() > 1 {
            counts.indels += 1;
        } else if ref_allele.len() == 1 {
            counts.snps += 1;
        } else {
            counts.mnps += 1;
        }
    }
    Ok(counts)
}

/// True when the VCF has no data records. Header-only files are empty.
pub fn has_no_records(path: &Path) -> Result<bool> {
    for line in vcf_reader(path)?.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            return Ok(false);
        }
    }
    Ok(true)
}
