mod bootstrap_helpers;
mod cli_args;
mod commands;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::{Cli, CliCommand};
use crate::commands::{run_analyze, write_report};

async fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        CliCommand::Analyze(args) => {
            let report = run_analyze(&args).await?;
            write_report(&args, &report)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run_cli(Cli::parse()).await
}
