//! spamflow CLI: a reproducible spam/ham classification pipeline.
//!
//! Runs the five built-in stages through a fingerprinting DAG runner,
//! moves tracked outputs to and from a content-addressed remote, and
//! records every evaluation in a local experiment database.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
