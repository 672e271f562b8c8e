use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use hoist::pipeline::{Cli, Pipeline};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // RUST_LOG=debug shows every command sent to the host.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_cli(cli).context("preparing target")?;
    pipeline.execute(&cli.command)?;
    Ok(())
}
