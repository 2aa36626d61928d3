use seq_io::fastq::Reader;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use flate2::read::MultiGzDecoder;
use crate::utils::file::is_gzipped;

pub enum FastqReader {
    Uncompressed(BufReader<File>),
    // Concatenated read chunks are multi-member gzip
    Gzipped(MultiGzDecoder<File>),
}

impl Read for FastqReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FastqReader::Uncompressed(r) => r.read(buf),
            FastqReader::Gzipped(r) => r.read(buf),
        }
    }
}

pub fn fastq_reader(path: &Path) -> io::Result<Reader<FastqReader>> {
    let file = File::open(path)?;
    let reader = if is_gzipped(path)? {
        Reader::new(FastqReader::Gzipped(MultiGzDecoder::new(file)))
    } else {
        Reader::new(FastqReader::Uncompressed(BufReader::new(file)))
    };
    Ok(reader)
}

/// Counts FASTQ records, failing on malformed input.
pub fn count_reads(path: &Path) -> anyhow::Result<u64> {
    let mut reader = fastq_reader(path)?;
    let mut count = 0u64;
    while let Some(record) = reader.next() {
        record.map_err(|e| anyhow::anyhow!("Malformed FASTQ in {}: {}", path.display(), e))?;
        count += 1;
    }
    Ok(count)
}
