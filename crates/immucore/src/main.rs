//! Immucore CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;

use immucore::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    cli.execute().await
}
