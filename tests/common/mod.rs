#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use varseq_pipelines::utils::command::{ToolInvocation, ToolOutcome, ToolRunner};

pub const VCF_HEADER: &str = "##fileformat=VCFv4.2\n##contig=<ID=chr1>\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n";

pub const FLAGSTAT: &str = "\
2 + 0 in total (QC-passed reads + QC-failed reads)
2 + 0 primary
0 + 0 secondary
0 + 0 supplementary
0 + 0 duplicates
0 + 0 primary duplicates
2 + 0 mapped (100.00% : N/A)
2 + 0 primary mapped (100.00% : N/A)
";

pub const READS: &str = "@r1\nACGTACGT\n+\nIIIIIIII\n@r2\nTTGCA\n+\nIIIII\n";

/// Stands in for every external tool: records the call, then fabricates the
/// outputs the invocation declares with content the summary parsers accept.
#[derive(Default)]
pub struct FakeRunner {
    pub calls: Mutex<Vec<ToolInvocation>>,
    /// (sample id, tool) pairs that exit non-zero.
    pub failures: Vec<(String, String)>,
    /// Samples whose caller reports zero records.
    pub no_variants: Vec<String>,
    /// Ordering problems seen at call time.
    pub violations: Mutex<Vec<String>>,
    pub delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        FakeRunner::default()
    }

    pub fn failing(mut self, sample: &str, tool: &str) -> Self {
        self.failures.push((sample.to_string(), tool.to_string()));
        self
    }

    pub fn without_variants(mut self, sample: &str) -> Self {
        self.no_variants.push(sample.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn tools(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|call| call.tool.clone()).collect()
    }

    pub fn calls_for(&self, sample: &str) -> Vec<ToolInvocation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| mentions(call, sample))
            .cloned()
            .collect()
    }

    fn check_ordering(&self, invocation: &ToolInvocation) {
        let mut violations = self.violations.lock().unwrap();
        if invocation.tool == "minimap2" && invocation.args.iter().any(|a| a == "-ax") {
            if let Some(reads) = invocation.args.iter().find(|a| a.ends_with("_filtered.fastq.gz")) {
                if !Path::new(reads).is_file() {
                    violations.push(format!("aligned before {} existed", reads));
                }
            }
        }
        if invocation.tool == "run_clair3.sh" {
            if let Some(bam) = invocation.args.iter().find_map(|a| a.strip_prefix("--bam_fn=")) {
                let bai = format!("{}.bai", bam);
                if !Path::new(bam).is_file() || !Path::new(&bai).is_file() {
                    violations.push(format!("called variants before {} was sorted and indexed", bam));
                }
            }
        }
    }

    fn fabricate(&self, invocation: &ToolInvocation, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let name = path.to_string_lossy();
        if name.ends_with(".fastq.gz") {
            let mut encoder = GzEncoder::new(File::create(path)?, Compression::fast());
            encoder.write_all(READS.as_bytes())?;
            encoder.finish()?;
        } else if name.ends_with("_alignment_stats.txt") {
            fs::write(path, FLAGSTAT)?;
        } else if name.ends_with(".vcf.gz") {
            let empty = self.no_variants.iter().any(|sample| mentions(invocation, sample));
            let mut text = VCF_HEADER.to_string();
            if !empty {
                text.push_str("chr1\t100\t.\tA\tG\t45\tPASS\t.\n");
                text.push_str("chr1\t200\t.\tAC\tA\t33\tPASS\t.\n");
                if invocation.tool == "run_clair3.sh" {
                    text.push_str("chr1\t300\t.\tT\tC\t5\tLowQual\t.\n");
                }
            }
            fs::write(path, text)?;
        } else {
            fs::write(path, format!("{} output\n", invocation.tool))?;
        }
        Ok(())
    }
}

fn mentions(invocation: &ToolInvocation, sample: &str) -> bool {
    let needle = format!("/{}/", sample);
    invocation.args.iter().any(|arg| arg.contains(&needle))
        || invocation.produces.iter().any(|path| path.to_string_lossy().contains(&needle))
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
        self.calls.lock().unwrap().push(invocation.clone());
        self.check_ordering(invocation);

        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fails = self
            .failures
            .iter()
            .any(|(sample, tool)| *tool == invocation.tool && mentions(invocation, sample));
        if fails {
            return Ok(ToolOutcome {
                exit_code: Some(2),
                success: false,
                stderr: format!("{}: simulated failure", invocation.tool),
                ..Default::default()
            });
        }
        for path in &invocation.produces {
            self.fabricate(invocation, path)?;
        }
        Ok(ToolOutcome {
            exit_code: Some(0),
            success: true,
            stderr: format!("{} finished", invocation.tool),
            ..Default::default()
        })
    }
}

/// Root with one directory per sample, each holding two read chunks, plus a
/// reference FASTA beside them.
pub fn batch_root(root: &Path, samples: &[&str]) -> Result<PathBuf> {
    for sample in samples {
        let dir = root.join(sample);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("chunk_0.fastq"), READS)?;
        let mut encoder = GzEncoder::new(File::create(dir.join("chunk_1.fastq.gz"))?, Compression::fast());
        encoder.write_all(READS.as_bytes())?;
        encoder.finish()?;
    }
    let reference = root.join("reference.fasta");
    fs::write(&reference, ">chr1\nACGTACGTACGTACGT\n")?;
    Ok(reference)
}
