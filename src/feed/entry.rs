use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::{Enclosure, Entry, EntryExtra};

/// One item as produced by the parsing layer.
///
/// Every field is optional in JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsedEntry {
    /// Content fingerprint; derived from `guid` or `url` when absent
    pub hash: Option<String>,
    pub guid: String,
    pub title: String,
    pub url: String,
    pub comments_url: String,
    pub content: String,
    pub author: String,
    pub tags: Vec<String>,
    /// Best-effort publication date; the fetch time when absent
    pub published_at: Option<DateTime<Utc>>,
    /// Estimated reading time in minutes
    pub reading_time: i64,
    pub enclosures: Vec<Enclosure>,
}

impl ParsedEntry {
    /// Deterministic hash identifying this item across polls.
    ///
    /// Uses the provided hash when present, otherwise SHA-256 of the first
    /// non-blank of guid, url and title + content.
    pub fn entry_hash(&self) -> String {
        if let Some(hash) = self.hash.as_deref().map(str::trim) {
            if !hash.is_empty() {
                return hash.to_string();
            }
        }

        let input = [self.guid.trim(), self.url.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}{}", self.title, self.content));

        format!("{:x}", Sha256::digest(input.as_bytes()))
    }

    /// Convert into an unsaved entry. `fetched_at` stands in for a missing
    /// publication date.
    pub fn into_entry(self, fetched_at: DateTime<Utc>) -> Entry {
        let hash = self.entry_hash();
        Entry {
            hash,
            title: self.title,
            url: self.url,
            comments_url: self.comments_url,
            content: self.content,
            author: self.author,
            reading_time: self.reading_time,
            tags: self.tags,
            extra: EntryExtra {
                enclosures: self.enclosures,
            },
            published_at: self.published_at.unwrap_or(fetched_at),
            ..Default::default()
        }
    }
}
