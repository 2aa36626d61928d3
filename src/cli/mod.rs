pub mod args;
pub mod menu;

use clap::Parser;
pub use args::{BatchArgs, PipelineArgs, StrategyKind, ToolArgs};

pub fn parse() -> PipelineArgs {
    PipelineArgs::parse()
}

pub fn parse_batch() -> BatchArgs {
    BatchArgs::parse()
}
