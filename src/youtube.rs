//! YouTube resumable upload client.
//!
//! The protocol is two steps: a POST that opens an upload session and returns
//! its URL in `Location`, then PUTs of 256 KiB-aligned chunks. A `308` reply
//! means "keep going" and its `Range` header says how much the server has.

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::UploaderSettings;
use crate::post_folder::PostInfo;

const UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/youtube/v3/videos";
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 256 * 1024;
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const MAX_TITLE_CHARS: usize = 100;
const MAX_DESCRIPTION_BYTES: usize = 5000;
const RETRYABLE_STATUSES: &[u16] = &[500, 502, 503, 504];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub video_id: String,
}

/// Publishes one media file with its post metadata.
pub trait UploadPublisher: Send + Sync {
    fn publish(&self, info: &PostInfo, media: &Path) -> Result<UploadReceipt>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub category_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub privacy_status: String,
    pub self_declared_made_for_kids: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoResource {
    pub snippet: Snippet,
    pub status: VideoStatus,
}

impl VideoResource {
    pub fn from_info(info: &PostInfo, settings: &UploaderSettings) -> Self {
        let title = info
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("r/{} {}", info.subreddit, info.sort_type));

        let mut sections = Vec::new();
        if let Some(body) = info.text_body.as_deref().map(str::trim)
            && !body.is_empty()
        {
            sections.push(body.to_string());
        }
        let mut credits = Vec::new();
        if let Some(author) = info.author.as_deref().filter(|author| !author.is_empty()) {
            credits.push(format!("Posted by u/{author}"));
        }
        if let Some(url) = info.url.as_deref().filter(|url| !url.is_empty()) {
            credits.push(format!("Source: {url}"));
        }
        if !credits.is_empty() {
            sections.push(credits.join("\n"));
        }

        Self {
            snippet: Snippet {
                title: truncate_chars(&strip_angle_brackets(&title), MAX_TITLE_CHARS),
                description: truncate_bytes(
                    &strip_angle_brackets(&sections.join("\n\n")),
                    MAX_DESCRIPTION_BYTES,
                ),
                tags: settings.tags.clone(),
                category_id: settings.category_id.clone(),
            },
            status: VideoStatus {
                privacy_status: settings.privacy_status.clone(),
                self_declared_made_for_kids: false,
            },
        }
    }
}

fn strip_angle_brackets(value: &str) -> String {
    value.chars().filter(|c| *c != '<' && *c != '>').collect()
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect::<String>().trim_end().to_string()
}

fn truncate_bytes(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Next byte to send after a `308`, from a `Range: bytes=0-N` header.
fn next_offset(range: Option<&str>) -> u64 {
    range
        .and_then(|value| value.trim().strip_prefix("bytes="))
        .and_then(|value| value.rsplit_once('-'))
        .and_then(|(_, last)| last.trim().parse::<u64>().ok())
        .map(|last| last + 1)
        .unwrap_or(0)
}

fn content_range(offset: u64, len: usize, total: u64) -> String {
    format!("bytes {}-{}/{}", offset, offset + len as u64 - 1, total)
}

fn read_chunk(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[derive(Deserialize)]
struct UploadedVideo {
    id: String,
}

enum ChunkOutcome {
    Complete(String),
    Continue(u64),
    Retry(String),
}

pub struct YouTubeClient {
    agent: ureq::Agent,
    auth: Mutex<Authenticator>,
    settings: UploaderSettings,
    endpoint: String,
    chunk_size: usize,
    retry_backoff: Duration,
}

impl YouTubeClient {
    pub fn new(auth: Authenticator, settings: UploaderSettings) -> Self {
        // 308 is part of the protocol here, never a redirect to follow.
        let agent = ureq::AgentBuilder::new()
            .redirects(0)
            .timeout_connect(Duration::from_secs(15))
            .timeout_read(Duration::from_secs(300))
            .build();
        Self {
            agent,
            auth: Mutex::new(auth),
            settings,
            endpoint: UPLOAD_ENDPOINT.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: String, chunk_size: usize) -> Self {
        self.endpoint = endpoint;
        self.chunk_size = chunk_size;
        self.retry_backoff = Duration::ZERO;
        self
    }

    fn bearer(&self) -> Result<String> {
        Ok(format!("Bearer {}", self.auth.lock().access_token()?))
    }

    fn open_session(&self, resource: &VideoResource, size: u64, content_type: &str) -> Result<String> {
        let response = self
            .agent
            .post(&self.endpoint)
            .query("uploadType", "resumable")
            .query("part", "snippet,status")
            .set("Authorization", &self.bearer()?)
            .set("X-Upload-Content-Length", &size.to_string())
            .set("X-Upload-Content-Type", content_type)
            .send_json(resource)
            .map_err(describe_error)
            .context("opening upload session")?;
        response
            .header("location")
            .map(str::to_string)
            .ok_or_else(|| anyhow!("upload session response carried no Location header"))
    }

    fn send_chunk(&self, session: &str, range: &str, bytes: &[u8]) -> Result<ChunkOutcome> {
        let result = self
            .agent
            .put(session)
            .set("Authorization", &self.bearer()?)
            .set("Content-Range", range)
            .send_bytes(bytes);
        classify_response(result)
    }

    fn query_offset(&self, session: &str, size: u64) -> Result<ChunkOutcome> {
        let result = self
            .agent
            .put(session)
            .set("Authorization", &self.bearer()?)
            .set("Content-Range", &format!("bytes */{size}"))
            .send_bytes(&[]);
        classify_response(result)
    }

    fn upload_file(&self, session: &str, media: &Path, size: u64) -> Result<String> {
        let mut file = File::open(media).with_context(|| format!("opening {}", media.display()))?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut offset = 0u64;
        let mut retries = 0u32;

        loop {
            file.seek(SeekFrom::Start(offset))?;
            let read = read_chunk(&mut file, &mut buffer)
                .with_context(|| format!("reading {}", media.display()))?;
            if read == 0 {
                bail!("server expects byte {offset} but {} has {size}", media.display());
            }

            let range = content_range(offset, read, size);
            debug!(%range, "sending chunk");
            let mut outcome = self.send_chunk(session, &range, &buffer[..read])?;
            loop {
                match outcome {
                    ChunkOutcome::Complete(video_id) => return Ok(video_id),
                    ChunkOutcome::Continue(next) => {
                        offset = next;
                        break;
                    }
                    ChunkOutcome::Retry(reason) => {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            bail!("giving up after {MAX_RETRIES} retries: {reason}");
                        }
                        warn!(retries, "upload interrupted, resuming: {reason}");
                        std::thread::sleep(self.retry_backoff * (1 << retries));
                        outcome = self.query_offset(session, size)?;
                    }
                }
            }
        }
    }
}

impl UploadPublisher for YouTubeClient {
    fn publish(&self, info: &PostInfo, media: &Path) -> Result<UploadReceipt> {
        let size = fs::metadata(media)
            .with_context(|| format!("inspecting {}", media.display()))?
            .len();
        if size == 0 {
            bail!("{} is empty", media.display());
        }
        let content_type = mime_guess::from_path(media)
            .first_or_octet_stream()
            .to_string();
        let resource = VideoResource::from_info(info, &self.settings);

        info!(
            title = %resource.snippet.title,
            file = %media.display(),
            size,
            "starting upload"
        );
        let session = self.open_session(&resource, size, &content_type)?;
        let video_id = self.upload_file(&session, media, size)?;
        Ok(UploadReceipt { video_id })
    }
}

fn describe_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            anyhow!("upload endpoint returned {code}: {body}")
        }
        other => anyhow!(other),
    }
}

fn classify_response(result: Result<ureq::Response, ureq::Error>) -> Result<ChunkOutcome> {
    match result {
        Ok(response) if response.status() == 308 => {
            Ok(ChunkOutcome::Continue(next_offset(response.header("range"))))
        }
        Ok(response) if matches!(response.status(), 200 | 201) => {
            let uploaded: UploadedVideo = response
                .into_json()
                .context("decoding uploaded video resource")?;
            Ok(ChunkOutcome::Complete(uploaded.id))
        }
        Ok(response) => bail!("unexpected upload status {}", response.status()),
        Err(ureq::Error::Status(code, _)) if RETRYABLE_STATUSES.contains(&code) => {
            Ok(ChunkOutcome::Retry(format!("status {code}")))
        }
        Err(ureq::Error::Transport(transport)) => Ok(ChunkOutcome::Retry(transport.to_string())),
        Err(err) => Err(describe_error(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ClientSecrets, StoredToken};
    use axum::{
        Router,
        body::{Body, Bytes},
        extract::State,
        http::{HeaderMap, Response, StatusCode},
        routing::{post, put},
    };
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn full_info() -> PostInfo {
        PostInfo {
            title: Some("  Sunrise <over> Varanasi ghats  ".into()),
            url: Some("https://reddit.com/r/india_tourism/comments/x/y/".into()),
            author: Some("pilgrim".into()),
            text_body: Some("Shot on a boat.".into()),
            subreddit: "india_tourism".into(),
            sort_type: "hot".into(),
            download_type: None,
            downloaded: "2024-03-09T14:05:07+05:30".into(),
        }
    }

    #[test]
    fn resource_uses_post_metadata() {
        let settings = UploaderSettings {
            tags: vec!["travel".into()],
            ..UploaderSettings::default()
        };
        let resource = VideoResource::from_info(&full_info(), &settings);
        assert_eq!(resource.snippet.title, "Sunrise over Varanasi ghats");
        assert_eq!(
            resource.snippet.description,
            "Shot on a boat.\n\nPosted by u/pilgrim\nSource: https://reddit.com/r/india_tourism/comments/x/y/"
        );
        assert_eq!(resource.status.privacy_status, "private");

        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["snippet"]["categoryId"], "22");
        assert_eq!(json["snippet"]["tags"][0], "travel");
        assert_eq!(json["status"]["privacyStatus"], "private");
    }

    #[test]
    fn resource_for_video_batch_uses_source_title() {
        let info = PostInfo {
            subreddit: "india_tourism".into(),
            sort_type: "top".into(),
            download_type: Some("videos_only".into()),
            ..PostInfo::default()
        };
        let resource = VideoResource::from_info(&info, &UploaderSettings::default());
        assert_eq!(resource.snippet.title, "r/india_tourism top");
        assert!(resource.snippet.description.is_empty());
        let json = serde_json::to_value(&resource).unwrap();
        assert!(json["snippet"].get("tags").is_none());
    }

    #[test]
    fn long_fields_are_truncated() {
        let info = PostInfo {
            title: Some("é".repeat(150)),
            text_body: Some("ü".repeat(4000)),
            ..PostInfo::default()
        };
        let resource = VideoResource::from_info(&info, &UploaderSettings::default());
        assert_eq!(resource.snippet.title.chars().count(), MAX_TITLE_CHARS);
        assert!(resource.snippet.description.len() <= MAX_DESCRIPTION_BYTES);
    }

    #[test]
    fn next_offset_parses_range_header() {
        assert_eq!(next_offset(Some("bytes=0-262143")), 262144);
        assert_eq!(next_offset(None), 0);
        assert_eq!(next_offset(Some("garbage")), 0);
    }

    #[test]
    fn content_range_is_inclusive() {
        assert_eq!(content_range(0, 4, 10), "bytes 0-3/10");
        assert_eq!(content_range(8, 2, 10), "bytes 8-9/10");
    }

    struct FakeYouTube {
        base: String,
        total: usize,
        received: parking_lot::Mutex<Vec<u8>>,
        metadata: parking_lot::Mutex<Option<serde_json::Value>>,
        ranges: parking_lot::Mutex<Vec<String>>,
        data_puts: AtomicUsize,
        fail_from_put: usize,
        failures_left: AtomicUsize,
    }

    impl FakeYouTube {
        fn new(base: String, total: usize) -> Self {
            Self::failing(base, total, 0, 0)
        }

        /// Answers 503 to `failures` data PUTs starting with the
        /// `fail_from_put`-th one.
        fn failing(base: String, total: usize, fail_from_put: usize, failures: usize) -> Self {
            Self {
                base,
                total,
                received: parking_lot::Mutex::new(Vec::new()),
                metadata: parking_lot::Mutex::new(None),
                ranges: parking_lot::Mutex::new(Vec::new()),
                data_puts: AtomicUsize::new(0),
                fail_from_put,
                failures_left: AtomicUsize::new(failures),
            }
        }

        fn progress(&self, received: &[u8]) -> Response<Body> {
            if received.len() >= self.total {
                return Response::builder()
                    .status(StatusCode::CREATED)
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"id":"vid42","kind":"youtube#video"}"#))
                    .unwrap();
            }
            let mut response = Response::builder().status(StatusCode::PERMANENT_REDIRECT);
            if !received.is_empty() {
                response = response.header("Range", format!("bytes=0-{}", received.len() - 1));
            }
            response.body(Body::empty()).unwrap()
        }
    }

    async fn open_session(State(server): State<Arc<FakeYouTube>>, body: Bytes) -> Response<Body> {
        *server.metadata.lock() = serde_json::from_slice(&body).ok();
        Response::builder()
            .status(StatusCode::OK)
            .header("Location", format!("{}/session", server.base))
            .body(Body::empty())
            .unwrap()
    }

    async fn receive_chunk(
        State(server): State<Arc<FakeYouTube>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response<Body> {
        let range = headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        server.ranges.lock().push(range.clone());
        if range.starts_with("bytes */") {
            return server.progress(&server.received.lock());
        }

        let put = server.data_puts.fetch_add(1, Ordering::SeqCst);
        if put >= server.fail_from_put && server.failures_left.load(Ordering::SeqCst) > 0 {
            server.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(Body::from("backend error"))
                .unwrap();
        }
        let mut received = server.received.lock();
        received.extend_from_slice(&body);
        server.progress(&received)
    }

    async fn serve_fake(server: Arc<FakeYouTube>, listener: tokio::net::TcpListener) {
        let app = Router::new()
            .route("/upload", post(open_session))
            .route("/session", put(receive_chunk))
            .with_state(server);
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
    }

    fn authenticator(dir: &Path) -> Authenticator {
        let secrets = ClientSecrets {
            client_id: "id".into(),
            client_secret: "secret".into(),
            auth_uri: "https://accounts.example/auth".into(),
            token_uri: "https://accounts.example/token".into(),
        };
        let token = StoredToken {
            access_token: "ya29.test".into(),
            refresh_token: Some("1//r".into()),
            expires_at: Utc::now() + ChronoDuration::seconds(3600),
            scope: crate::auth::UPLOAD_SCOPE.into(),
            token_type: "Bearer".into(),
        };
        Authenticator::with_token(secrets, dir.join("token.json"), Some(token))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_streams_file_in_chunks() -> Result<()> {
        let temp = tempdir()?;
        let media = temp.path().join("clip.mp4");
        fs::write(&media, b"0123456789")?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let server = Arc::new(FakeYouTube::new(base.clone(), 10));
        serve_fake(server.clone(), listener).await;

        let client = YouTubeClient::new(authenticator(temp.path()), UploaderSettings::default())
            .with_endpoint(format!("{base}/upload"), 4);
        let info = full_info();
        let receipt =
            tokio::task::spawn_blocking(move || client.publish(&info, &media)).await??;

        assert_eq!(receipt.video_id, "vid42");
        assert_eq!(server.received.lock().as_slice(), b"0123456789");
        assert_eq!(
            *server.ranges.lock(),
            vec!["bytes 0-3/10", "bytes 4-7/10", "bytes 8-9/10"]
        );
        let metadata = server.metadata.lock().clone().expect("metadata posted");
        assert_eq!(metadata["snippet"]["title"], "Sunrise over Varanasi ghats");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_resumes_after_server_error() -> Result<()> {
        let temp = tempdir()?;
        let media = temp.path().join("clip.mp4");
        fs::write(&media, b"0123456789")?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let server = Arc::new(FakeYouTube::failing(base.clone(), 10, 1, 1));
        serve_fake(server.clone(), listener).await;

        let client = YouTubeClient::new(authenticator(temp.path()), UploaderSettings::default())
            .with_endpoint(format!("{base}/upload"), 4);
        let info = full_info();
        let receipt =
            tokio::task::spawn_blocking(move || client.publish(&info, &media)).await??;

        assert_eq!(receipt.video_id, "vid42");
        assert_eq!(server.received.lock().as_slice(), b"0123456789");
        assert_eq!(
            *server.ranges.lock(),
            vec![
                "bytes 0-3/10",
                "bytes 4-7/10",
                "bytes */10",
                "bytes 4-7/10",
                "bytes 8-9/10"
            ]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_gives_up_after_repeated_errors() -> Result<()> {
        let temp = tempdir()?;
        let media = temp.path().join("clip.mp4");
        fs::write(&media, b"0123456789")?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let server = Arc::new(FakeYouTube::failing(base.clone(), 10, 0, 10));
        serve_fake(server.clone(), listener).await;

        let client = YouTubeClient::new(authenticator(temp.path()), UploaderSettings::default())
            .with_endpoint(format!("{base}/upload"), 4);
        let info = full_info();
        let result = tokio::task::spawn_blocking(move || client.publish(&info, &media)).await?;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("giving up"));
        assert!(server.received.lock().is_empty());
        assert_eq!(
            server.data_puts.load(Ordering::SeqCst),
            MAX_RETRIES as usize + 1
        );
        Ok(())
    }

    #[test]
    fn publish_rejects_empty_file() -> Result<()> {
        let temp = tempdir()?;
        let media = temp.path().join("empty.mp4");
        fs::write(&media, b"")?;
        let client = YouTubeClient::new(authenticator(temp.path()), UploaderSettings::default());
        let err = client.publish(&full_info(), &media).unwrap_err();
        assert!(err.to_string().contains("is empty"));
        Ok(())
    }
}
