//! Command-line interface for the pull-through cache
//!
//! This module contains argument parsing, command definitions and the
//! dispatch from a parsed command to the pull operations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::app::App;
use crate::commands::{self, Source};
use crate::config::AppConfig;

/// Command-line interface for the pull-through cache
#[derive(Parser)]
#[command(name = "pullcache")]
#[command(about = "Pull-through cache for container registry proxy projects")]
#[command(version)]
pub struct Cli {
    /// Configuration file (JSON); defaults apply when it does not exist
    #[arg(long, short, global = true, default_value = "pullcache.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve a manifest by tag or digest and print it
    Manifest {
        /// Repository, with or without the project prefix
        repository: String,
        /// Tag or digest
        reference: String,
        /// Proxy project the repository belongs to
        #[arg(long)]
        project: String,
        /// Wait until an upstream manifest has been cached
        #[arg(long)]
        wait: bool,
    },
    /// Stream a blob to a file or stdout
    Blob {
        /// Repository, with or without the project prefix
        repository: String,
        /// Blob digest
        digest: String,
        /// Proxy project the repository belongs to
        #[arg(long)]
        project: String,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Pull a manifest with all its blobs into the cache
    Pull {
        /// Repository, with or without the project prefix
        repository: String,
        /// Tag or digest
        reference: String,
        /// Proxy project the repository belongs to
        #[arg(long)]
        project: String,
    },
    /// Remove uploads left behind by interrupted blob writes
    Clean,
    /// Print the effective configuration as JSON
    Config,
}

pub async fn execute(cli: Cli) -> Result<()> {
    let config = AppConfig::load_or_default(&cli.config)?;
    let app = App::open(config).await?;
    let result = run(&app, cli.command).await;
    app.shutdown().await;
    result
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Manifest {
            repository,
            reference,
            project,
            wait,
        } => {
            let art = commands::artifact(&project, &repository, &reference);
            let fetch = commands::fetch_manifest(app, &art).await?;
            eprintln!(
                "{}:{} ({}) served from {}",
                art.repository,
                reference,
                fetch.manifest.digest(),
                fetch.source
            );

            let mut stdout = tokio::io::stdout();
            stdout.write_all(&fetch.manifest.payload).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;

            if let Some(caching) = fetch.caching {
                if wait {
                    caching.await.context("Manifest cache task panicked")?;
                } else {
                    info!("Not waiting for the manifest to be cached (use --wait)");
                }
            }
            Ok(())
        }
        Commands::Blob {
            repository,
            digest,
            project,
            output,
        } => {
            commands::ensure_digest(&digest)?;
            let art = commands::artifact(&project, &repository, &digest);

            let fetched = match &output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    commands::fetch_blob(app, &art, &mut file).await?
                }
                None => commands::fetch_blob(app, &art, &mut tokio::io::stdout()).await?,
            };

            let cached = match (fetched.source, fetched.cache_write) {
                (Source::Local, _) => "already cached",
                (Source::Upstream, Some(true)) => "cached",
                (Source::Upstream, Some(false)) => "not cached",
                (Source::Upstream, None) => "cached by a concurrent request",
            };
            eprintln!(
                "{} ({} bytes) served from {}, {cached}",
                digest, fetched.bytes, fetched.source
            );
            Ok(())
        }
        Commands::Pull {
            repository,
            reference,
            project,
        } => {
            let art = commands::artifact(&project, &repository, &reference);
            let summary = commands::pull(app, art).await?;
            println!(
                "Pulled {} manifest(s): {} blob(s) fetched from upstream, {} already cached",
                summary.manifests, summary.blobs_fetched, summary.blobs_local
            );
            Ok(())
        }
        Commands::Clean => {
            let removed = commands::clean(app).await?;
            println!("Removed {removed} partial upload(s)");
            Ok(())
        }
        Commands::Config => {
            println!("{}", app.config.to_json()?);
            Ok(())
        }
    }
}
