mod args;
mod core;
mod llc;
mod os;
mod sim;
mod sim_config;
mod trace;

use std::io::stdout;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::args::Args;
use crate::sim::Simulation;
use crate::sim_config::SimConfig;

fn init_tracing(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &args.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path.file_name().unwrap_or_else(|| "ferrite.log".as_ref());
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(&args);

    let conf = match &args.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };

    let mut sim = Simulation::new(&args, &conf)?;
    sim.run()?;
    sim.write_stats(&mut stdout().lock())?;
    Ok(())
}
