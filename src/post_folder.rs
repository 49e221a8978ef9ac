//! The on-disk handoff unit between the collector and the uploader.
//!
//! A Post Folder holds media files plus a single `info.json`. The collector
//! writes `info.json` last and atomically, so its presence is the readiness
//! signal the uploader keys off. [`inspect`] is the one place that decides
//! whether a folder is ready.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::SortMode;
use crate::reddit::Post;

pub const INFO_FILE: &str = "info.json";
pub const UPLOADED_MARKER: &str = ".uploaded";
pub const VIDEOS_ONLY: &str = "videos_only";
const FOLDER_TIMESTAMP: &str = "%Y-%m-%d_%H-%M-%S";
const PARTIAL_EXTENSIONS: &[&str] = &["part", "tmp", "ytdl"];

/// Metadata snapshot written next to the media.
///
/// Video-only folders carry no per-post fields; those stay `None` and are
/// left out of the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub sort_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_type: Option<String>,
    #[serde(default)]
    pub downloaded: String,
}

impl PostInfo {
    pub fn for_post(post: &Post, sort: SortMode, downloaded: DateTime<Local>) -> Self {
        Self {
            title: Some(post.title.clone()),
            url: Some(post.canonical_url()),
            author: Some(post.author.clone()),
            text_body: Some(post.selftext.clone()),
            subreddit: post.subreddit.clone(),
            sort_type: sort.to_string(),
            download_type: None,
            downloaded: iso_timestamp(downloaded),
        }
    }

    pub fn for_video_batch(subreddit: &str, sort: SortMode, downloaded: DateTime<Local>) -> Self {
        Self {
            subreddit: subreddit.to_string(),
            sort_type: sort.to_string(),
            download_type: Some(VIDEOS_ONLY.to_string()),
            downloaded: iso_timestamp(downloaded),
            ..Self::default()
        }
    }
}

pub fn iso_timestamp(at: DateTime<Local>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub fn post_folder_name(at: DateTime<Local>, post_id: &str) -> String {
    let id = if post_id.trim().is_empty() {
        "unknown"
    } else {
        post_id
    };
    format!("{}_{}", at.format(FOLDER_TIMESTAMP), id)
}

pub fn video_batch_folder_name(at: DateTime<Local>, subreddit: &str, sort: SortMode) -> String {
    format!("{}_{}_{}_videos", at.format(FOLDER_TIMESTAMP), subreddit, sort)
}

/// Writes `info.json` through a temporary sibling so readers never see a
/// half-written file.
pub fn write_info(folder: &Path, info: &PostInfo) -> Result<PathBuf> {
    let path = folder.join(INFO_FILE);
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(info)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("finalizing {}", path.display()))?;
    Ok(path)
}

pub fn read_info(folder: &Path) -> Result<PostInfo> {
    let path = folder.join(INFO_FILE);
    let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn is_empty_dir(folder: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(folder).with_context(|| format!("listing {}", folder.display()))?;
    Ok(entries.next().is_none())
}

/// Removes `folder` only when nothing was written into it.
pub fn remove_if_empty(folder: &Path) -> Result<bool> {
    if !folder.exists() || !is_empty_dir(folder)? {
        return Ok(false);
    }
    fs::remove_dir(folder).with_context(|| format!("removing {}", folder.display()))?;
    Ok(true)
}

/// Every media file under `folder`, video files first, then by path.
pub fn media_files(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_media_candidate(folder, path))
        .collect();
    files.sort_by(|a, b| (!is_video(a), a).cmp(&(!is_video(b), b)));
    files
}

fn is_media_candidate(folder: &Path, path: &Path) -> bool {
    let top_level = path.parent() == Some(folder);
    if let Some(name) = path.file_name().and_then(|name| name.to_str())
        && top_level
        && (name == INFO_FILE || name == UPLOADED_MARKER)
    {
        return false;
    }
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => !PARTIAL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => true,
    }
}

pub fn is_video(path: &Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .is_some_and(|mime| mime.type_() == mime_guess::mime::VIDEO)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Missing,
    AwaitingMetadata,
    InvalidMetadata(String),
    NoMedia,
    AlreadyUploaded,
    Ready { info: PostInfo, media: Vec<PathBuf> },
}

/// Classifies a Post Folder from what is on disk right now.
pub fn inspect(folder: &Path) -> Readiness {
    if !folder.is_dir() {
        return Readiness::Missing;
    }
    if folder.join(UPLOADED_MARKER).exists() {
        return Readiness::AlreadyUploaded;
    }
    if !folder.join(INFO_FILE).is_file() {
        return Readiness::AwaitingMetadata;
    }
    let info = match read_info(folder) {
        Ok(info) => info,
        Err(err) => return Readiness::InvalidMetadata(format!("{err:#}")),
    };
    let media = media_files(folder);
    if media.is_empty() {
        return Readiness::NoMedia;
    }
    Readiness::Ready { info, media }
}
