//! Append-only record of post URLs the collector has already attempted.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Newline-delimited set of canonical post URLs.
///
/// The file is re-read on every membership check so the bulk video facility
/// and the collector loop always agree on what has been seen.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// Opens the ledger, creating an empty backing file when needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening ledger {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, url: &str) -> Result<bool> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        Ok(content.lines().any(|line| line == url))
    }

    pub fn record(&self, url: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening ledger {}", self.path.display()))?;
        writeln!(file, "{url}").with_context(|| format!("recording {url}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_ledger_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let ledger = Ledger::open(dir.path().join("downloaded_urls.txt"))?;
        assert!(ledger.path().exists());
        assert!(!ledger.contains("https://reddit.com/r/pics/comments/1/x/")?);
        Ok(())
    }

    #[test]
    fn record_then_contains_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("seen.txt");
        let url = "https://reddit.com/r/pics/comments/abc/title/";

        let ledger = Ledger::open(&path)?;
        ledger.record(url)?;
        assert!(ledger.contains(url)?);

        let reopened = Ledger::open(&path)?;
        assert!(reopened.contains(url)?);
        assert_eq!(fs::read_to_string(&path)?, format!("{url}\n"));
        Ok(())
    }

    #[test]
    fn membership_is_exact_match() -> Result<()> {
        let dir = tempdir()?;
        let ledger = Ledger::open(dir.path().join("seen.txt"))?;
        ledger.record("https://reddit.com/r/a/comments/1/x/")?;
        assert!(!ledger.contains("https://www.reddit.com/r/a/comments/1/x/")?);
        assert!(!ledger.contains("https://reddit.com/r/a/comments/1/x")?);
        Ok(())
    }

    #[test]
    fn duplicate_records_are_tolerated() -> Result<()> {
        let dir = tempdir()?;
        let ledger = Ledger::open(dir.path().join("seen.txt"))?;
        ledger.record("u")?;
        ledger.record("u")?;
        assert!(ledger.contains("u")?);
        assert_eq!(fs::read_to_string(ledger.path())?.lines().count(), 2);
        Ok(())
    }
}
