//! bulkmapper CLI: bulk entity mapping against the Mapper API.
//!
//! Reads a file of raw company, domain or product strings, queries the
//! Mapper API with adaptive concurrency, and appends the results to a CSV.

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
