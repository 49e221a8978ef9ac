#![forbid(unsafe_code)]

//! Uploads finished Post Folders to YouTube and removes them afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use relaytube_tools::auth::Authenticator;
use relaytube_tools::config::{
    RuntimeOverrides, load_pipeline_config_or_default, resolve_runtime_paths,
};
use relaytube_tools::logging::init_tracing;
use relaytube_tools::security::ensure_not_root;
use relaytube_tools::uploader::{FolderOutcome, Uploader, spawn_directory_watcher};
use relaytube_tools::youtube::YouTubeClient;
use tokio::signal;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "uploader", about = "Publish Post Folders to YouTube")]
struct UploaderArgs {
    /// Directory watched for Post Folders.
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
    /// Pipeline configuration; the `uploader` section is read from it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    client_secret: Option<PathBuf>,
    #[arg(long)]
    token: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Process existing folders once and exit without watching.
    #[arg(long)]
    scan_only: bool,
}

impl UploaderArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            downloads_dir: self.downloads_dir.clone(),
            config_path: self.config.clone(),
            client_secret_path: self.client_secret.clone(),
            token_path: self.token.clone(),
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = UploaderArgs::parse();
    init_tracing("uploader");
    ensure_not_root("uploader")?;

    let paths = resolve_runtime_paths(args.overrides())?;
    if !paths.downloads_dir.is_dir() {
        bail!(
            "downloads directory {} does not exist",
            paths.downloads_dir.display()
        );
    }
    let config = load_pipeline_config_or_default(&paths.config_path)?;
    let auth = Authenticator::load(&paths.client_secret_path, &paths.token_path)?;
    let client = YouTubeClient::new(auth, config.uploader.clone());
    let uploader = Arc::new(Uploader::new(
        client,
        paths.downloads_dir.clone(),
        config.uploader,
    ));

    // Subscribe before the scan so folders created meanwhile are not missed.
    let events = if args.scan_only {
        None
    } else {
        Some(spawn_directory_watcher(&paths.downloads_dir)?)
    };

    let scanner = Arc::clone(&uploader);
    let outcomes = tokio::task::spawn_blocking(move || scanner.startup_scan()).await??;
    let uploaded = outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, FolderOutcome::Uploaded { .. }))
        .count();
    info!(scanned = outcomes.len(), uploaded, "startup scan finished");

    let Some(events) = events else {
        return Ok(());
    };
    uploader.run(events, shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}
