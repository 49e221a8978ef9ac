#![forbid(unsafe_code)]

//! Runtime path resolution and the pipeline configuration file.
//!
//! Paths follow the usual precedence: CLI override, process environment,
//! `.env` file, built-in default. The pipeline file (`config.json` or
//! `config.toml`) is read once at startup and handed to each component as a
//! plain value.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env, fmt, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_LEDGER_FILE: &str = "downloaded_urls.txt";
pub const DEFAULT_CLIENT_SECRET_FILE: &str = "client_secret.json";
pub const DEFAULT_TOKEN_FILE: &str = "token.json";
pub const DEFAULT_INTERVAL_MINUTES: u64 = 10;
pub const FALLBACK_MAX_ATTEMPTS: usize = 2;

pub fn default_user_agent() -> String {
    format!("relaytube-collector/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub downloads_dir: PathBuf,
    pub config_path: PathBuf,
    pub ledger_path: PathBuf,
    pub client_secret_path: PathBuf,
    pub token_path: PathBuf,
    pub user_agent: String,
}

impl RuntimePaths {
    /// `cookies.txt` sitting next to the downloads directory, if any.
    pub fn cookies_path(&self) -> PathBuf {
        self.downloads_dir
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("cookies.txt")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_dir: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub client_secret_path: Option<PathBuf>,
    pub token_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_paths_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimePaths {
    build_runtime_paths_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_paths_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimePaths {
    let path_for = |override_value: Option<PathBuf>, key: &str, default: &str| {
        override_value
            .or_else(|| lookup_value(key, file_vars, &env_lookup).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default))
    };

    let downloads_dir = path_for(
        overrides.downloads_dir,
        "RELAYTUBE_DOWNLOADS_DIR",
        DEFAULT_DOWNLOADS_DIR,
    );
    let config_path = path_for(overrides.config_path, "RELAYTUBE_CONFIG", DEFAULT_CONFIG_FILE);
    let ledger_path = path_for(overrides.ledger_path, "RELAYTUBE_LEDGER", DEFAULT_LEDGER_FILE);
    let client_secret_path = path_for(
        overrides.client_secret_path,
        "RELAYTUBE_CLIENT_SECRET",
        DEFAULT_CLIENT_SECRET_FILE,
    );
    let token_path = path_for(overrides.token_path, "RELAYTUBE_TOKEN", DEFAULT_TOKEN_FILE);
    let user_agent = lookup_value("RELAYTUBE_USER_AGENT", file_vars, &env_lookup)
        .unwrap_or_else(default_user_agent);

    RuntimePaths {
        downloads_dir,
        config_path,
        ledger_path,
        client_secret_path,
        token_path,
        user_agent,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_blank(&value))
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).and_then(|value| non_blank(value)))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Listing sort orders understood by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    Hot,
    New,
    Top,
    Rising,
    Controversial,
    Best,
}

impl SortMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SortMode::Hot => "hot",
            SortMode::New => "new",
            SortMode::Top => "top",
            SortMode::Rising => "rising",
            SortMode::Controversial => "controversial",
            SortMode::Best => "best",
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `[source, sort, video_only]` entry of the `subreddits` list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String, SortMode, bool)")]
pub struct SourceConfig {
    pub subreddit: String,
    pub sort: SortMode,
    pub videos_only: bool,
}

impl SourceConfig {
    pub fn new(subreddit: impl Into<String>, sort: SortMode, videos_only: bool) -> Self {
        Self {
            subreddit: subreddit.into(),
            sort,
            videos_only,
        }
    }
}

impl From<(String, SortMode, bool)> for SourceConfig {
    fn from((subreddit, sort, videos_only): (String, SortMode, bool)) -> Self {
        Self::new(subreddit, sort, videos_only)
    }
}

/// How deep into a listing the fetcher may look, per sort mode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AttemptLimits(BTreeMap<String, usize>);

impl AttemptLimits {
    pub fn max_for(&self, sort: SortMode) -> usize {
        self.0
            .get(sort.as_str())
            .copied()
            .unwrap_or(FALLBACK_MAX_ATTEMPTS)
    }

    pub fn with_limit(mut self, sort: SortMode, limit: usize) -> Self {
        self.0.insert(sort.as_str().to_string(), limit);
        self
    }
}

impl Default for AttemptLimits {
    fn default() -> Self {
        let mut limits = BTreeMap::new();
        limits.insert("hot".to_string(), 2);
        limits.insert("top".to_string(), 2);
        limits.insert("new".to_string(), 1);
        Self(limits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UploaderSettings {
    pub poll_interval_secs: u64,
    pub poll_attempts: u32,
    pub privacy_status: String,
    pub category_id: String,
    pub tags: Vec<String>,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            poll_attempts: 30,
            privacy_status: "private".to_string(),
            category_id: "22".to_string(),
            tags: Vec::new(),
        }
    }
}

/// Parsed pipeline configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Legacy single-source key, only consulted when `subreddits` is absent.
    pub subreddit: Option<String>,
    pub interval_minutes: u64,
    pub subreddits: Option<Vec<SourceConfig>>,
    pub max_attempts: AttemptLimits,
    pub uploader: UploaderSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            subreddit: None,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            subreddits: None,
            max_attempts: AttemptLimits::default(),
            uploader: UploaderSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Sources in priority order for every collection cycle.
    pub fn sources(&self) -> Vec<SourceConfig> {
        if let Some(list) = &self.subreddits {
            return list.clone();
        }
        if let Some(name) = self.subreddit.as_deref().and_then(non_blank) {
            return vec![SourceConfig::new(name, SortMode::Hot, false)];
        }
        default_sources()
    }
}

pub fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new("india_tourism", SortMode::Hot, true),
        SourceConfig::new("india_tourism", SortMode::Hot, false),
        SourceConfig::new("india_tourism", SortMode::Top, false),
        SourceConfig::new("IncredibleIndia", SortMode::Top, false),
        SourceConfig::new("india_tourism", SortMode::New, false),
    ]
}

/// Reads the pipeline file. A missing file is an error: the binaries treat it
/// as fatal before entering their loops.
pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        bail!("configuration file {} is missing", path.display());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    parse_pipeline_config(&raw, path)
}

/// Like [`load_pipeline_config`] but falls back to defaults when the file is
/// absent. Parse errors are still reported.
pub fn load_pipeline_config_or_default(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        return Ok(PipelineConfig::default());
    }
    load_pipeline_config(path)
}

fn parse_pipeline_config(raw: &str, path: &Path) -> Result<PipelineConfig> {
    let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
    if is_toml {
        toml::from_str(raw).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_json::from_str(raw).with_context(|| format!("parsing {}", path.display()))
    }
}
