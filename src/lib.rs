// src/lib.rs
pub mod config;
pub mod utils;
pub mod pipelines;
pub mod cli;

use std::io::Write;
use env_logger::Builder;
use log::LevelFilter;

pub use cli::{BatchArgs, PipelineArgs};

/// Logger shared by both binaries: `[timestamp] LEVEL: message`.
pub fn init_logging(verbose: bool) {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();
}
