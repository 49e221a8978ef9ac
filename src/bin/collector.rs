#![forbid(unsafe_code)]

//! Periodically saves one fresh Reddit post per cycle into the downloads
//! directory.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relaytube_tools::collector::Collector;
use relaytube_tools::config::{RuntimeOverrides, load_pipeline_config, resolve_runtime_paths};
use relaytube_tools::downloader::{YtDlp, ensure_program_available};
use relaytube_tools::ledger::Ledger;
use relaytube_tools::logging::init_tracing;
use relaytube_tools::reddit::RedditClient;
use relaytube_tools::security::ensure_not_root;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "collector", about = "Collect Reddit media into Post Folders")]
struct CollectorArgs {
    /// Directory that receives Post Folders.
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
    /// Pipeline configuration (JSON, or TOML by extension).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Downloaded-URL ledger file.
    #[arg(long)]
    ledger: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

impl CollectorArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            downloads_dir: self.downloads_dir.clone(),
            config_path: self.config.clone(),
            ledger_path: self.ledger.clone(),
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }
}

fn main() -> Result<()> {
    let args = CollectorArgs::parse();
    init_tracing("collector");
    ensure_not_root("collector")?;

    let paths = resolve_runtime_paths(args.overrides())?;
    let config = load_pipeline_config(&paths.config_path)?;

    fs::create_dir_all(&paths.downloads_dir)
        .with_context(|| format!("creating {}", paths.downloads_dir.display()))?;
    let ledger = Ledger::open(&paths.ledger_path)?;
    ensure_program_available("yt-dlp")?;

    let reddit = RedditClient::new(&paths.user_agent);
    let downloader = YtDlp::new(
        reddit.clone(),
        &paths.user_agent,
        Some(paths.cookies_path()),
    );
    let collector = Collector::new(config, reddit, downloader, ledger, &paths.downloads_dir);

    if args.once {
        match collector.run_cycle() {
            Some(folder) => info!(folder = %folder.display(), "cycle finished"),
            None => info!("cycle finished without a download"),
        }
        return Ok(());
    }
    collector.run_forever()
}
