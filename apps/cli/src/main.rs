//! pdfpipe CLI: worker and maintenance commands for the PDF pipeline.
//!
//! Drives uploaded PDFs through html, clean html, markdown and plain-text
//! stages, resuming from whatever state the database records.

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
