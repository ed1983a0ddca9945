//! Feed source reading parsed entries from a spool directory.
//!
//! An upstream fetcher drops `<feed_id>.json` files, each holding a JSON array
//! of [`ParsedEntry`]. A feed without a file has nothing new.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{FeedSource, SourceError};
use crate::feed::ParsedEntry;
use crate::storage::Job;

/// Read a JSON array of parsed entries from `path`.
pub async fn read_entries(path: &Path) -> Result<Vec<ParsedEntry>, SourceError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[derive(Debug, Clone)]
pub struct SpoolSource {
    dir: PathBuf,
}

impl SpoolSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, feed_id: i64) -> PathBuf {
        self.dir.join(format!("{feed_id}.json"))
    }
}

impl FeedSource for SpoolSource {
    async fn fetch(&self, job: &Job) -> Result<Vec<ParsedEntry>, SourceError> {
        let path = self.path_for(job.feed_id);
        match read_entries(&path).await {
            Err(SourceError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(feed_id = job.feed_id, path = %path.display(), "No spool file");
                Ok(Vec::new())
            }
            other => other,
        }
    }
}
