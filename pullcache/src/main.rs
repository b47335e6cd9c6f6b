//! pullcache: pull-through cache for container registry proxy projects

mod app;
mod cli;
mod commands;
mod config;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = pullcache_logging::init_from_env().context("Failed to initialize logging")?;

    let cli = Cli::parse();
    cli::execute(cli).await
}
