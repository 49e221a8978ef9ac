//! Picks the highest ranked post of a listing that is not in the ledger yet.

use tracing::{info, warn};

use crate::config::{AttemptLimits, SortMode};
use crate::ledger::Ledger;
use crate::reddit::{LISTING_LIMIT, ListingSource, Post};

pub struct PostFetcher<'a, S> {
    listing: &'a S,
    ledger: &'a Ledger,
    limits: &'a AttemptLimits,
}

impl<'a, S: ListingSource> PostFetcher<'a, S> {
    pub fn new(listing: &'a S, ledger: &'a Ledger, limits: &'a AttemptLimits) -> Self {
        Self {
            listing,
            ledger,
            limits,
        }
    }

    pub fn fetch_next(&self, subreddit: &str, sort: SortMode) -> Option<Post> {
        self.fetch_from_rank(subreddit, sort, 0)
    }

    /// Walks ranks `start_rank..max_attempts[sort]` of a single listing request
    /// and returns the first post whose canonical URL is not recorded. Every
    /// failure collapses into `None`.
    pub fn fetch_from_rank(&self, subreddit: &str, sort: SortMode, start_rank: usize) -> Option<Post> {
        let max_allowed = self.limits.max_for(sort);
        if start_rank >= max_allowed {
            return None;
        }

        let mut posts = match self.listing.fetch_listing(subreddit, sort, LISTING_LIMIT) {
            Ok(posts) => posts,
            Err(err) => {
                warn!(subreddit, %sort, "failed to fetch posts: {err:#}");
                return None;
            }
        };

        if posts.is_empty() || start_rank >= posts.len() {
            info!(subreddit, %sort, "no more new posts available");
            return None;
        }

        let end = max_allowed.min(posts.len());
        for rank in start_rank..end {
            let url = posts[rank].canonical_url();
            match self.ledger.contains(&url) {
                Ok(true) => {
                    info!(subreddit, %sort, rank = rank + 1, "post already downloaded, trying next");
                }
                Ok(false) => return Some(posts.swap_remove(rank)),
                Err(err) => {
                    warn!(subreddit, %sort, %url, "could not consult ledger: {err:#}");
                    return None;
                }
            }
        }

        if end < max_allowed {
            info!(subreddit, %sort, "no more new posts available");
        }
        None
    }
}
