//! Public Reddit listing endpoint.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::SortMode;

const LISTING_BASE: &str = "https://www.reddit.com";
const CANONICAL_BASE: &str = "https://reddit.com";
pub const LISTING_LIMIT: usize = 10;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: Post,
}

/// A listing entry. Everything is optional on Reddit's side, so every field
/// defaults rather than failing the whole listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub post_hint: Option<String>,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub is_video: bool,
}

impl Post {
    /// The ledger key for this post.
    pub fn canonical_url(&self) -> String {
        canonical_url(&self.permalink)
    }

    pub fn is_image(&self) -> bool {
        self.post_hint.as_deref() == Some("image")
    }
}

pub fn canonical_url(permalink: &str) -> String {
    format!("{CANONICAL_BASE}{permalink}")
}

/// Anything that can list the newest entries of a subreddit.
pub trait ListingSource {
    fn fetch_listing(&self, subreddit: &str, sort: SortMode, limit: usize) -> Result<Vec<Post>>;
}

impl<T: ListingSource + ?Sized> ListingSource for &T {
    fn fetch_listing(&self, subreddit: &str, sort: SortMode, limit: usize) -> Result<Vec<Post>> {
        (**self).fetch_listing(subreddit, sort, limit)
    }
}

/// Blocking client for `/r/<subreddit>/<sort>.json`.
#[derive(Clone)]
pub struct RedditClient {
    agent: ureq::Agent,
    base: String,
}

impl RedditClient {
    pub fn new(user_agent: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(user_agent)
            .build();
        Self {
            agent,
            base: LISTING_BASE.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base(mut self, base: String) -> Self {
        self.base = base;
        self
    }

    pub fn listing_url(&self, subreddit: &str, sort: SortMode) -> String {
        format!("{}/r/{subreddit}/{sort}.json", self.base)
    }
}

impl ListingSource for RedditClient {
    fn fetch_listing(&self, subreddit: &str, sort: SortMode, limit: usize) -> Result<Vec<Post>> {
        let url = self.listing_url(subreddit, sort);
        debug!(%url, limit, "requesting listing");
        let response = self
            .agent
            .get(&url)
            .query("limit", &limit.to_string())
            .query("raw_json", "1")
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    anyhow!("listing request for {url} returned status {code}")
                }
                other => anyhow!(other).context(format!("requesting {url}")),
            })?;

        let body = response
            .into_string()
            .with_context(|| format!("reading listing body from {url}"))?;
        parse_listing(&body).with_context(|| format!("decoding listing from {url}"))
    }
}

pub fn parse_listing(body: &str) -> Result<Vec<Post>> {
    let listing: Listing = serde_json::from_str(body)?;
    Ok(listing
        .data
        .children
        .into_iter()
        .map(|child| child.data)
        .collect())
}
