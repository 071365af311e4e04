use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use depot::config;
use depot::ingest::Ingestor;
use depot::migrate::{MigrationOptions, MigrationOrchestrator};
use depot::model::MigrationStatus;
use depot::object_store::S3ObjectStore;
use depot::pool::{Pool, PoolOptions};
use depot::staging::IncomingFile;
use depot::store::MySqlConnector;

/// Administrative driver for the persistence core. The HTTP routing layer
/// owns the public surface; this binary exposes the same operations for
/// operators and local use.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reset migration state and run the external migration tool.
    Migrate {
        /// Keep previously generated scripts in the versions directory.
        #[arg(long)]
        keep_scripts: bool,
        /// Skip the script-generation step (tool flag `-r`).
        #[arg(long)]
        skip_generation: bool,
        /// Skip applying migrations (tool flag `-u`).
        #[arg(long)]
        skip_apply: bool,
    },
    /// Ingest one or more files for an owning user.
    Ingest {
        /// Id of the owning user.
        #[arg(long)]
        owner: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::from_env()?;

    let connector = MySqlConnector::from_config(&cfg.database);
    let pool = Pool::new(connector, PoolOptions::from_config(&cfg.database));

    match args.command {
        Command::Migrate {
            keep_scripts,
            skip_generation,
            skip_apply,
        } => {
            let admin = MySqlConnector::admin(&cfg.database);
            let orchestrator = MigrationOrchestrator::new(
                pool,
                admin,
                cfg.migration.clone(),
                cfg.database.name.clone(),
            );
            let run = orchestrator
                .run(MigrationOptions {
                    delete_existing_scripts: !keep_scripts,
                    skip_generation,
                    skip_apply,
                })
                .await?;
            info!(status = run.status.as_str(), "migration run complete");
            println!("{}", serde_json::to_string_pretty(&run)?);
            if run.status != MigrationStatus::Success {
                std::process::exit(1);
            }
        }
        Command::Ingest { owner, files } => {
            let store = Arc::new(S3ObjectStore::from_config(&cfg.object_store)?);
            let ingestor = Ingestor::new(pool, store, cfg.staging_dir.clone());

            let mut incoming = Vec::with_capacity(files.len());
            for path in &files {
                let bytes = tokio::fs::read(path).await?;
                let filename = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("upload.bin")
                    .to_string();
                let content_type = mime_guess::from_path(path)
                    .first_or_octet_stream()
                    .to_string();
                incoming.push(IncomingFile {
                    filename,
                    content_type,
                    bytes,
                });
            }

            let blobs = ingestor.ingest_all(&incoming, &owner).await?;
            info!(count = blobs.len(), "ingestion complete");
            println!("{}", serde_json::to_string_pretty(&blobs)?);
        }
    }

    Ok(())
}
