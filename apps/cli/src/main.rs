//! taxogen CLI: grow three-level taxonomies with an LLM classifier.
//!
//! Creates taxonomies, marks nodes for expansion, and runs concurrent
//! expansion rounds against an OpenAI-compatible endpoint.

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
