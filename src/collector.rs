//! The collection loop: one best-effort download per cycle.

use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{PipelineConfig, SourceConfig};
use crate::downloader::{MediaDownloader, VideoBatch};
use crate::fetcher::PostFetcher;
use crate::ledger::Ledger;
use crate::post_folder::{
    PostInfo, is_empty_dir, post_folder_name, remove_if_empty, video_batch_folder_name,
    write_info,
};
use crate::reddit::ListingSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Saved(PathBuf),
    NoPost,
    Failed,
}

pub struct Collector<L, D> {
    config: PipelineConfig,
    sources: Vec<SourceConfig>,
    listing: L,
    downloader: D,
    ledger: Ledger,
    downloads_dir: PathBuf,
}

impl<L: ListingSource, D: MediaDownloader> Collector<L, D> {
    pub fn new(
        config: PipelineConfig,
        listing: L,
        downloader: D,
        ledger: Ledger,
        downloads_dir: impl Into<PathBuf>,
    ) -> Self {
        let sources = config.sources();
        Self {
            config,
            sources,
            listing,
            downloader,
            ledger,
            downloads_dir: downloads_dir.into(),
        }
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    /// Runs cycles forever, sleeping `interval_minutes` between them.
    pub fn run_forever(&self) -> ! {
        let interval = self.cycle_interval();
        info!(
            sources = self.sources.len(),
            interval_minutes = self.config.interval_minutes,
            "processing subreddit configurations"
        );
        loop {
            self.run_cycle();
            info!(minutes = self.config.interval_minutes, "waiting for next cycle");
            thread::sleep(interval);
        }
    }

    fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_minutes.saturating_mul(60))
    }

    /// Tries each configured source in order and stops at the first success.
    pub fn run_cycle(&self) -> Option<PathBuf> {
        for source in &self.sources {
            if let AttemptOutcome::Saved(folder) = self.try_source(source) {
                return Some(folder);
            }
        }
        warn!("nothing downloaded this cycle");
        None
    }

    pub fn try_source(&self, source: &SourceConfig) -> AttemptOutcome {
        info!(
            subreddit = %source.subreddit,
            sort = %source.sort,
            videos_only = source.videos_only,
            "fetching"
        );
        let result = if source.videos_only {
            self.try_video_batch(source)
        } else {
            self.try_single_post(source)
        };
        result.unwrap_or_else(|err| {
            warn!(subreddit = %source.subreddit, "failed: {err:#}");
            AttemptOutcome::Failed
        })
    }

    fn try_video_batch(&self, source: &SourceConfig) -> Result<AttemptOutcome> {
        let now = Local::now();
        let folder = self.downloads_dir.join(video_batch_folder_name(
            now,
            &source.subreddit,
            source.sort,
        ));
        create_folder(&folder)?;

        let batch = VideoBatch {
            subreddit: &source.subreddit,
            sort: source.sort,
            count: 1,
            ledger: &self.ledger,
        };
        if let Err(err) = self.downloader.download_subreddit_videos(&batch, &folder) {
            warn!(folder = %folder.display(), "video download failed: {err:#}");
            remove_if_empty(&folder)?;
            return Ok(AttemptOutcome::Failed);
        }

        if is_empty_dir(&folder)? {
            warn!(folder = %folder.display(), "no videos downloaded, folder is empty");
            fs::remove_dir(&folder).with_context(|| format!("removing {}", folder.display()))?;
            return Ok(AttemptOutcome::Failed);
        }

        let info = PostInfo::for_video_batch(&source.subreddit, source.sort, Local::now());
        write_info(&folder, &info)?;
        info!(folder = %folder.display(), "saved videos + info.json");
        Ok(AttemptOutcome::Saved(folder))
    }

    fn try_single_post(&self, source: &SourceConfig) -> Result<AttemptOutcome> {
        let fetcher = PostFetcher::new(&self.listing, &self.ledger, &self.config.max_attempts);
        let Some(post) = fetcher.fetch_next(&source.subreddit, source.sort) else {
            info!(subreddit = %source.subreddit, sort = %source.sort, "no posts returned");
            return Ok(AttemptOutcome::NoPost);
        };

        let url = post.canonical_url();
        info!(
            title = %post.title,
            hint = post.post_hint.as_deref().unwrap_or("N/A"),
            %url,
            media = post.url.as_deref().unwrap_or("N/A"),
            "selected post"
        );

        let folder = self
            .downloads_dir
            .join(post_folder_name(Local::now(), &post.id));
        create_folder(&folder)?;

        if let Err(err) = self.downloader.download_post(&post, &folder) {
            warn!(%url, "download failed: {err:#}");
            remove_if_empty(&folder)?;
            return Ok(AttemptOutcome::Failed);
        }

        if is_empty_dir(&folder)? {
            warn!(%url, "no media downloaded, folder is empty");
            // Recorded anyway so a dead post is not retried every cycle.
            self.ledger.record(&url)?;
            fs::remove_dir(&folder).with_context(|| format!("removing {}", folder.display()))?;
            return Ok(AttemptOutcome::Failed);
        }

        let info = PostInfo::for_post(&post, source.sort, Local::now());
        write_info(&folder, &info)?;
        // The folder is already handed off; a ledger failure only risks a re-download.
        if let Err(err) = self.ledger.record(&url) {
            warn!(%url, "could not record in ledger: {err:#}");
        }
        info!(folder = %folder.display(), "saved media + info.json");
        Ok(AttemptOutcome::Saved(folder))
    }
}

fn create_folder(folder: &Path) -> Result<()> {
    fs::create_dir_all(folder).with_context(|| format!("creating {}", folder.display()))
}
