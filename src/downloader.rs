//! Media download facility: yt-dlp for anything hosted, a direct HTTP fetch
//! for plain image links.

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
#[cfg(test)]
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::SortMode;
use crate::ledger::Ledger;
use crate::reddit::{LISTING_LIMIT, ListingSource, Post, REQUEST_TIMEOUT};

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

fn yt_dlp_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("yt-dlp")
}

#[cfg(test)]
pub(crate) fn set_ytdlp_stub_path(path: PathBuf) -> YtDlpStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    *YT_DLP_STUB.lock().unwrap() = Some(path);
    YtDlpStubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub(crate) struct YtDlpStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for YtDlpStubGuard {
    fn drop(&mut self) {
        *YT_DLP_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// Parameters of a video-only bulk download.
pub struct VideoBatch<'a> {
    pub subreddit: &'a str,
    pub sort: SortMode,
    pub count: usize,
    pub ledger: &'a Ledger,
}

pub trait MediaDownloader {
    /// Saves the media of a single post into `dest`.
    fn download_post(&self, post: &Post, dest: &Path) -> Result<()>;

    /// Saves up to `batch.count` not-yet-seen video posts into `dest`,
    /// recording each one in the ledger.
    fn download_subreddit_videos(&self, batch: &VideoBatch<'_>, dest: &Path) -> Result<()>;
}

/// Runs `<name> --version` to fail loudly when yt-dlp is missing.
pub fn ensure_program_available(name: &str) -> Result<()> {
    let status = Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", name),
        Err(err) => bail!("{} is not installed or not in PATH: {}", name, err),
    }
}

pub struct YtDlp<S> {
    listing: S,
    http: ureq::Agent,
    cookies: Option<PathBuf>,
}

impl<S: ListingSource> YtDlp<S> {
    pub fn new(listing: S, user_agent: &str, cookies: Option<PathBuf>) -> Self {
        let http = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT * 6)
            .user_agent(user_agent)
            .build();
        Self {
            listing,
            http,
            cookies: cookies.filter(|path| path.exists()),
        }
    }

    fn run_ytdlp(&self, url: &str, output_template: &Path) -> Result<()> {
        let mut command = yt_dlp_command();
        command
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("--no-warnings")
            .arg("--no-overwrites")
            .arg("--output")
            .arg(output_template.to_string_lossy().to_string())
            .arg(url);

        if let Some(cookies) = &self.cookies {
            command
                .arg("--cookies")
                .arg(cookies.to_string_lossy().to_string());
        }

        debug!(%url, "running yt-dlp");
        let status = command
            .status()
            .with_context(|| format!("launching yt-dlp for {url}"))?;
        if !status.success() {
            bail!("yt-dlp exited with {} for {}", status, url);
        }
        Ok(())
    }

    fn fetch_image(&self, media_url: &str, post_id: &str, dest: &Path) -> Result<PathBuf> {
        let response = self
            .http
            .get(media_url)
            .call()
            .with_context(|| format!("requesting {media_url}"))?;
        let extension = image_extension(media_url, response.header("content-type"));
        let path = dest.join(format!("{post_id}.{extension}"));
        let mut file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        io::copy(&mut response.into_reader(), &mut file)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

impl<S: ListingSource> MediaDownloader for YtDlp<S> {
    fn download_post(&self, post: &Post, dest: &Path) -> Result<()> {
        if post.is_image()
            && let Some(media_url) = post.url.as_deref()
        {
            let path = self.fetch_image(media_url, &post.id, dest)?;
            info!(file = %path.display(), "saved image");
            return Ok(());
        }
        self.run_ytdlp(&post.canonical_url(), &dest.join("%(id)s.%(ext)s"))
    }

    fn download_subreddit_videos(&self, batch: &VideoBatch<'_>, dest: &Path) -> Result<()> {
        let posts = self
            .listing
            .fetch_listing(batch.subreddit, batch.sort, LISTING_LIMIT)?;

        let mut downloaded = 0usize;
        for post in posts.iter().filter(|post| post.is_video) {
            if downloaded >= batch.count {
                break;
            }
            let url = post.canonical_url();
            if batch.ledger.contains(&url)? {
                continue;
            }
            let template = dest.join(format!("video_{}.%(ext)s", post.id));
            match self.run_ytdlp(&url, &template) {
                Ok(()) => {
                    batch.ledger.record(&url)?;
                    downloaded += 1;
                }
                Err(err) => warn!(%url, "video download failed: {err:#}"),
            }
        }
        debug!(subreddit = batch.subreddit, downloaded, "video batch finished");
        Ok(())
    }
}

/// Picks a file extension from the URL path, falling back to the response
/// content type.
fn image_extension(media_url: &str, content_type: Option<&str>) -> String {
    let from_path = url::Url::parse(media_url).ok().and_then(|parsed| {
        Path::new(parsed.path())
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    });
    if let Some(ext) = from_path
        && !ext.is_empty()
    {
        return ext;
    }
    let Some(mime) = content_type
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().to_ascii_lowercase())
    else {
        return "jpg".to_string();
    };
    let known = match mime.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    };
    known
        .or_else(|| {
            mime_guess::get_mime_extensions_str(&mime)
                .and_then(|extensions| extensions.first().copied())
        })
        .unwrap_or("jpg")
        .to_string()
}
