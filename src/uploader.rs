//! Uploader side of the pipeline: turns ready Post Folders into YouTube
//! videos and removes them afterwards.
//!
//! Each folder moves through `discovered -> awaiting metadata -> ready ->
//! uploaded | abandoned`. Abandoned folders are never deleted.

use anyhow::{Context, Result, bail};
use inotify::{EventMask, Inotify, WatchMask};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::UploaderSettings;
use crate::post_folder::{INFO_FILE, Readiness, UPLOADED_MARKER, inspect};
use crate::youtube::UploadPublisher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderOutcome {
    Uploaded { video_id: String },
    /// A marker from an earlier run was found; the folder was only removed.
    Cleared,
    /// Skipped during the startup pass because `info.json` is not there yet.
    AwaitingMetadata,
    Abandoned(String),
    Failed,
    Missing,
}

enum WaitResult {
    Settled,
    Vanished,
    TimedOut,
}

pub struct Uploader<P> {
    publisher: P,
    downloads_dir: PathBuf,
    settings: UploaderSettings,
}

impl<P: UploadPublisher + 'static> Uploader<P> {
    pub fn new(publisher: P, downloads_dir: PathBuf, settings: UploaderSettings) -> Self {
        Self {
            publisher,
            downloads_dir,
            settings,
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Applies the ready/uploaded/abandoned rules to a folder as it is now.
    /// Blocking: a ready folder is uploaded on the calling thread.
    pub fn process_folder(&self, folder: &Path) -> FolderOutcome {
        let name = folder_label(folder);
        match inspect(folder) {
            Readiness::Missing => FolderOutcome::Missing,
            Readiness::AwaitingMetadata => {
                info!(folder = %name, "skipped: no {INFO_FILE} yet");
                FolderOutcome::AwaitingMetadata
            }
            Readiness::InvalidMetadata(reason) => {
                warn!(folder = %name, "skipped: unreadable {INFO_FILE}: {reason}");
                FolderOutcome::Abandoned(reason)
            }
            Readiness::NoMedia => {
                warn!(folder = %name, "skipped: no media files");
                FolderOutcome::Abandoned("no media files".to_string())
            }
            Readiness::AlreadyUploaded => {
                info!(folder = %name, "already uploaded, removing");
                match remove_folder(folder) {
                    Ok(()) => FolderOutcome::Cleared,
                    Err(err) => {
                        error!(folder = %name, "failed to remove: {err:#}");
                        FolderOutcome::Failed
                    }
                }
            }
            Readiness::Ready { info, media } => {
                let file = &media[0];
                match self.publisher.publish(&info, file) {
                    Ok(receipt) => {
                        info!(folder = %name, video_id = %receipt.video_id, "uploaded");
                        if let Err(err) = fs::write(folder.join(UPLOADED_MARKER), &receipt.video_id)
                        {
                            warn!(folder = %name, "could not write upload marker: {err}");
                        }
                        if let Err(err) = remove_folder(folder) {
                            error!(folder = %name, "uploaded but not removed: {err:#}");
                        }
                        FolderOutcome::Uploaded {
                            video_id: receipt.video_id,
                        }
                    }
                    Err(err) => {
                        error!(folder = %name, file = %file.display(), "failed: {err:#}");
                        FolderOutcome::Failed
                    }
                }
            }
        }
    }

    /// One pass over every folder already present, in name order.
    pub fn startup_scan(&self) -> Result<Vec<(PathBuf, FolderOutcome)>> {
        if !self.downloads_dir.is_dir() {
            bail!(
                "downloads directory {} does not exist",
                self.downloads_dir.display()
            );
        }
        let mut folders = Vec::new();
        for entry in fs::read_dir(&self.downloads_dir)
            .with_context(|| format!("listing {}", self.downloads_dir.display()))?
        {
            match entry {
                Ok(entry) if entry.path().is_dir() => folders.push(entry.path()),
                Ok(_) => {}
                Err(err) => warn!(
                    dir = %self.downloads_dir.display(),
                    "skipped unreadable entry: {err}"
                ),
            }
        }
        folders.sort();

        info!(count = folders.len(), "scanning existing folders");
        let outcomes = folders
            .into_iter()
            .map(|folder| {
                let outcome = self.process_folder(&folder);
                (folder, outcome)
            })
            .collect();
        Ok(outcomes)
    }

    async fn wait_for_metadata(&self, folder: &Path) -> WaitResult {
        let interval = Duration::from_secs(self.settings.poll_interval_secs);
        for attempt in 0..self.settings.poll_attempts {
            match inspect(folder) {
                Readiness::Missing => return WaitResult::Vanished,
                Readiness::AwaitingMetadata => {
                    debug!(folder = %folder_label(folder), attempt, "waiting for metadata");
                    tokio::time::sleep(interval).await;
                }
                _ => return WaitResult::Settled,
            }
        }
        match inspect(folder) {
            Readiness::Missing => WaitResult::Vanished,
            Readiness::AwaitingMetadata => WaitResult::TimedOut,
            _ => WaitResult::Settled,
        }
    }

    /// Drives a freshly created folder to completion.
    pub async fn handle_new_folder(self: Arc<Self>, folder: PathBuf) -> FolderOutcome {
        match self.wait_for_metadata(&folder).await {
            WaitResult::Vanished => {
                debug!(folder = %folder_label(&folder), "folder disappeared");
                return FolderOutcome::Missing;
            }
            WaitResult::TimedOut => {
                warn!(
                    folder = %folder_label(&folder),
                    attempts = self.settings.poll_attempts,
                    "skipped: {INFO_FILE} never appeared"
                );
                return FolderOutcome::Abandoned("metadata timeout".to_string());
            }
            WaitResult::Settled => {}
        }

        let uploader = Arc::clone(&self);
        let label = folder_label(&folder);
        match tokio::task::spawn_blocking(move || uploader.process_folder(&folder)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(folder = %label, "upload task panicked: {err}");
                FolderOutcome::Failed
            }
        }
    }

    /// Handles folders from `events` until `shutdown` resolves or the event
    /// source goes away.
    pub async fn run<F>(self: Arc<Self>, mut events: UnboundedReceiver<PathBuf>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(pending = tasks.len(), "shutting down");
                    break;
                }
                received = events.recv(), if events_open => match received {
                    Some(folder) => {
                        debug!(folder = %folder_label(&folder), "new folder");
                        tasks.spawn(Arc::clone(&self).handle_new_folder(folder));
                    }
                    None => {
                        warn!("folder events stopped");
                        events_open = false;
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
            if !events_open && tasks.is_empty() {
                break;
            }
        }
    }
}

fn remove_folder(folder: &Path) -> Result<()> {
    fs::remove_dir_all(folder).with_context(|| format!("removing {}", folder.display()))
}

fn folder_label(folder: &Path) -> String {
    folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.display().to_string())
}

/// Subscribes to directories created in or moved into `dir`. Events are read
/// on a dedicated thread and forwarded as full paths.
pub fn spawn_directory_watcher(dir: &Path) -> Result<UnboundedReceiver<PathBuf>> {
    let inotify = Inotify::init().context("initializing inotify")?;
    inotify
        .watches()
        .add(dir, WatchMask::CREATE | WatchMask::MOVED_TO)
        .with_context(|| format!("watching {}", dir.display()))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let root = dir.to_path_buf();
    std::thread::Builder::new()
        .name("folder-watch".to_string())
        .spawn(move || {
            if let Err(err) = forward_directory_events(inotify, &root, &tx) {
                error!(dir = %root.display(), "watcher stopped: {err:#}");
            }
        })
        .context("spawning watcher thread")?;
    info!(dir = %dir.display(), "watching for new folders");
    Ok(rx)
}

fn forward_directory_events(
    mut inotify: Inotify,
    root: &Path,
    tx: &UnboundedSender<PathBuf>,
) -> Result<()> {
    let mut buffer = [0u8; 4096];
    loop {
        let events = inotify
            .read_events_blocking(&mut buffer)
            .context("reading inotify events")?;
        for event in events {
            if !event.mask.contains(EventMask::ISDIR) {
                continue;
            }
            let Some(name) = event.name else {
                continue;
            };
            if tx.send(root.join(name)).is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortMode;
    use crate::post_folder::{PostInfo, write_info};
    use crate::youtube::UploadReceipt;
    use chrono::Local;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakePublisher {
        fail: bool,
        published: Mutex<Vec<PathBuf>>,
    }

    impl FakePublisher {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.published.lock().len()
        }
    }

    impl UploadPublisher for FakePublisher {
        fn publish(&self, _info: &PostInfo, media: &Path) -> Result<UploadReceipt> {
            self.published.lock().push(media.to_path_buf());
            if self.fail {
                bail!("quota exceeded");
            }
            Ok(UploadReceipt {
                video_id: format!("vid{}", self.calls()),
            })
        }
    }

    fn info() -> PostInfo {
        PostInfo::for_video_batch("india_tourism", SortMode::Hot, Local::now())
    }

    fn ready_folder(root: &Path, name: &str) -> Result<PathBuf> {
        let folder = root.join(name);
        fs::create_dir_all(&folder)?;
        fs::write(folder.join("clip.mp4"), "video")?;
        write_info(&folder, &info())?;
        Ok(folder)
    }

    fn uploader(root: &Path, publisher: FakePublisher) -> Uploader<FakePublisher> {
        Uploader::new(publisher, root.to_path_buf(), UploaderSettings::default())
    }

    #[test]
    fn successful_upload_removes_folder() -> Result<()> {
        let dir = tempdir()?;
        let folder = ready_folder(dir.path(), "2024-03-09_14-05-07_abc")?;
        let uploader = uploader(dir.path(), FakePublisher::default());

        let outcome = uploader.process_folder(&folder);
        assert_eq!(
            outcome,
            FolderOutcome::Uploaded {
                video_id: "vid1".into()
            }
        );
        assert!(!folder.exists());
        assert_eq!(*uploader.publisher().published.lock(), vec![folder.join("clip.mp4")]);
        Ok(())
    }

    #[test]
    fn failed_upload_keeps_folder() -> Result<()> {
        let dir = tempdir()?;
        let folder = ready_folder(dir.path(), "2024-03-09_14-05-07_abc")?;
        let uploader = uploader(dir.path(), FakePublisher::failing());

        assert_eq!(uploader.process_folder(&folder), FolderOutcome::Failed);
        assert!(folder.join(INFO_FILE).exists());
        assert!(folder.join("clip.mp4").exists());
        assert!(!folder.join(UPLOADED_MARKER).exists());
        Ok(())
    }

    #[test]
    fn marked_folder_is_removed_without_upload() -> Result<()> {
        let dir = tempdir()?;
        let folder = ready_folder(dir.path(), "done")?;
        fs::write(folder.join(UPLOADED_MARKER), "vid0")?;
        let uploader = uploader(dir.path(), FakePublisher::default());

        assert_eq!(uploader.process_folder(&folder), FolderOutcome::Cleared);
        assert!(!folder.exists());
        assert_eq!(uploader.publisher().calls(), 0);
        Ok(())
    }

    #[test]
    fn startup_scan_keeps_incomplete_folders() -> Result<()> {
        let dir = tempdir()?;
        let no_media = dir.path().join("a_no_media");
        fs::create_dir_all(&no_media)?;
        write_info(&no_media, &info())?;
        let pending = dir.path().join("b_pending");
        fs::create_dir_all(&pending)?;
        fs::write(pending.join("clip.mp4"), "video")?;
        let ready = ready_folder(dir.path(), "c_ready")?;
        fs::write(dir.path().join("stray.txt"), "not a folder")?;

        let uploader = uploader(dir.path(), FakePublisher::default());
        let outcomes = uploader.startup_scan()?;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].0, no_media);
        assert!(matches!(outcomes[0].1, FolderOutcome::Abandoned(_)));
        assert_eq!(outcomes[1].1, FolderOutcome::AwaitingMetadata);
        assert!(matches!(outcomes[2].1, FolderOutcome::Uploaded { .. }));
        assert!(no_media.exists());
        assert!(pending.exists());
        assert!(!ready.exists());
        Ok(())
    }

    #[test]
    fn startup_scan_requires_downloads_dir() {
        let uploader = uploader(Path::new("/nonexistent/relaytube"), FakePublisher::default());
        let err = uploader.startup_scan().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_waits_for_late_metadata() -> Result<()> {
        let dir = tempdir()?;
        let folder = dir.path().join("2024-03-09_14-05-07_late");
        fs::create_dir_all(&folder)?;
        fs::write(folder.join("clip.mp4"), "video")?;

        let uploader = Arc::new(uploader(dir.path(), FakePublisher::default()));
        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(Arc::clone(&uploader).handle_new_folder(folder.clone()));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(uploader.publisher().calls(), 0);
        assert!(folder.exists());
        write_info(&folder, &info())?;

        let outcome = handle.await?;
        assert!(matches!(outcome, FolderOutcome::Uploaded { .. }));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(uploader.publisher().calls(), 1);
        assert!(!folder.exists());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_timeout_abandons_folder() -> Result<()> {
        let dir = tempdir()?;
        let folder = dir.path().join("stalled");
        fs::create_dir_all(&folder)?;
        fs::write(folder.join("clip.mp4"), "video")?;

        let uploader = Arc::new(uploader(dir.path(), FakePublisher::default()));
        let start = tokio::time::Instant::now();
        let outcome = Arc::clone(&uploader).handle_new_folder(folder.clone()).await;

        assert!(matches!(outcome, FolderOutcome::Abandoned(_)));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(folder.exists());
        assert_eq!(uploader.publisher().calls(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_folder_ends_quietly() -> Result<()> {
        let dir = tempdir()?;
        let uploader = Arc::new(uploader(dir.path(), FakePublisher::default()));
        let outcome = uploader.handle_new_folder(dir.path().join("gone")).await;
        assert_eq!(outcome, FolderOutcome::Missing);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn run_processes_forwarded_folders() -> Result<()> {
        let dir = tempdir()?;
        let folder = ready_folder(dir.path(), "2024-03-09_14-05-07_abc")?;
        let uploader = Arc::new(uploader(dir.path(), FakePublisher::default()));

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(folder.clone())?;
        drop(tx);
        Arc::clone(&uploader).run(rx, std::future::pending()).await;

        assert_eq!(uploader.publisher().calls(), 1);
        assert!(!folder.exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn startup_scan_survives_odd_entries() -> Result<()> {
        use std::os::unix::fs::{PermissionsExt, symlink};

        let dir = tempdir()?;
        symlink(dir.path().join("nowhere"), dir.path().join("a_dangling"))?;
        let locked = dir.path().join("b_locked");
        fs::create_dir_all(&locked)?;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;
        let ready = ready_folder(dir.path(), "c_ready")?;

        let uploader = uploader(dir.path(), FakePublisher::default());
        let outcomes = uploader.startup_scan();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;

        let outcomes = outcomes?;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].0, locked);
        assert!(matches!(outcomes[1].1, FolderOutcome::Uploaded { .. }));
        assert!(!ready.exists());
        assert!(locked.exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_forwards_created_and_moved_in_directories() -> Result<()> {
        let root = tempdir()?;
        let downloads = root.path().join("downloads");
        let staging = root.path().join("staging");
        fs::create_dir_all(&downloads)?;
        fs::create_dir_all(staging.join("moved"))?;

        let mut events = spawn_directory_watcher(&downloads)?;
        fs::write(downloads.join("stray.txt"), "not a folder")?;
        fs::create_dir(downloads.join("created"))?;
        fs::rename(staging.join("moved"), downloads.join("moved"))?;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let folder = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await?
                .expect("watcher still running");
            seen.push(folder);
        }
        assert_eq!(seen, vec![downloads.join("created"), downloads.join("moved")]);
        assert!(
            tokio::time::timeout(Duration::from_millis(300), events.recv())
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watched_folder_is_uploaded_once_metadata_lands() -> Result<()> {
        let dir = tempdir()?;
        let events = spawn_directory_watcher(dir.path())?;
        let uploader = Arc::new(uploader(dir.path(), FakePublisher::default()));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = tokio::spawn(Arc::clone(&uploader).run(events, async {
            let _ = stop_rx.await;
        }));

        let folder = dir.path().join("2024-03-09_14-05-07_live");
        fs::create_dir(&folder)?;
        fs::write(folder.join("c.mp4"), "video")?;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(uploader.publisher().calls(), 0);
        assert!(folder.exists());

        write_info(&folder, &info())?;
        for _ in 0..100 {
            if !folder.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!folder.exists());
        assert_eq!(uploader.publisher().calls(), 1);

        let _ = stop_tx.send(());
        runner.await?;
        Ok(())
    }
}
