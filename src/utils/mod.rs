pub mod command;
pub mod fastq;
pub mod file;
pub mod reference;
pub mod sambam;
pub mod sample;
pub mod system;
pub mod vcf;
