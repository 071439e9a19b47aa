mod config;

use anyhow::{Context, Result};
use clap::Parser;
use session_sync::{HttpKeyService, SessionBootstrap};
use std::{path::PathBuf, sync::Arc};
use storage::Storage;
use tracing::{error, info};

use crate::config::{load_settings, normalize_database_url};

/// Publishes identity keys and synchronizes sessions for the logged-in account.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "bootstrap.toml")]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    access_token: Option<String>,
    #[arg(long)]
    retry_delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.database_url {
        settings.database_url = v;
    }
    if let Some(v) = args.access_token {
        settings.set_access_token(&v);
    }
    if let Some(v) = args.retry_delay_ms {
        settings.retry_delay_ms = v;
    }

    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open {database_url}"))?;
    storage.health_check().await?;
    info!(server_url = %settings.server_url, %database_url, "bootstrap: starting");

    let remote = Arc::new(HttpKeyService::new(
        settings.server_url.clone(),
        settings.access_token.clone(),
    ));
    let worker = SessionBootstrap::load(storage, remote, settings.bootstrap_options())
        .await?
        .spawn();

    match worker.await.context("bootstrap worker panicked")? {
        Ok(report) => {
            println!(
                "provisioning={:?} synchronization={:?}",
                report.provisioning, report.synchronization
            );
            Ok(())
        }
        Err(err) if err.is_terminal_auth() => {
            error!(error = %err, "bootstrap: credentials rejected, log in again");
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}
