use std::path::PathBuf;

use clap::Parser;

/// Ferrite memory-system simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the instruction trace file
    #[arg(required = true)]
    pub trace: PathBuf,

    /// TOML configuration overriding the DDR5-4800 defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Instructions to simulate per core
    #[arg(long, default_value_t = 10_000_000)]
    pub inst: u64,

    /// Number of cores, each replaying the trace
    #[arg(long, default_value_t = 1)]
    pub cores: usize,

    /// Seed for page placement and mitigation sampling
    #[arg(long, default_value_t = 0x5EED_CAFE)]
    pub seed: u64,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}
