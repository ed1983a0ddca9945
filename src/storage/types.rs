use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage errors, each carrying the operation that failed.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("Another process appears to hold the database lock. Please close it and try again.")]
    InstanceLocked,

    /// The database file could not be opened or created
    #[error("Unable to open database {path}: {source}")]
    CannotOpen {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),

    /// A statement failed; `context` names the operation
    #[error("{context}: {source}")]
    Query {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// An inner storage error wrapped with the caller's operation
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<DatabaseError>,
    },

    /// A stored value could not be decoded
    #[error("Invalid stored value: {0}")]
    Decode(String),

    /// The feed does not exist or belongs to another user
    #[error("storage: feed #{feed_id} of user #{user_id} not found")]
    FeedNotFound { user_id: i64, feed_id: i64 },

    /// A value could not be serialized for storage
    #[error("Unable to encode value: {0}")]
    Encode(String),

    /// Bulk-inserted rows could not all be read back by hash
    #[error("storage: {missing} inserted entries of feed #{feed_id} could not be read back")]
    Correlation { feed_id: i64, missing: usize },
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }

    /// Classify an error raised while connecting to the database at `path`.
    pub(crate) fn from_open_error(path: &str, err: sqlx::Error) -> Self {
        // SQLITE_CANTOPEN (14)
        let cannot_open = err
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .is_some_and(|code| code == "14")
            || err
                .to_string()
                .to_lowercase()
                .contains("unable to open database file");
        if cannot_open {
            return DatabaseError::CannotOpen {
                path: path.to_string(),
                source: err,
            };
        }

        Self::from_sqlx(err)
    }

    /// Wrap a failed statement with the operation it belonged to.
    pub(crate) fn query(context: impl Into<String>, source: sqlx::Error) -> Self {
        DatabaseError::Query {
            context: context.into(),
            source,
        }
    }

    /// Wrap this error with an outer operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        DatabaseError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

// ============================================================================
// Timestamps
// ============================================================================

// Timestamps are stored as Unix milliseconds so SQL comparisons stay numeric.

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Current time truncated to the stored precision.
pub(crate) fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

// ============================================================================
// Entry Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Unread,
    Read,
    Removed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Unread => "unread",
            EntryStatus::Read => "read",
            EntryStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(EntryStatus::Unread),
            "read" => Ok(EntryStatus::Read),
            "removed" => Ok(EntryStatus::Removed),
            other => Err(DatabaseError::Decode(format!("unknown entry status {other:?}"))),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Media attached to an entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub url: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: i64,
}

/// Free-form entry data persisted as a JSON object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryExtra {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enclosures: Vec<Enclosure>,
}

/// A feed subscription of one user
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub id: i64,
    pub user_id: i64,
    pub feed_url: String,
    pub title: String,
    pub category_id: Option<i64>,
    pub disabled: bool,
    pub parsing_error_count: i64,
    pub parsing_error_msg: String,
    pub checked_at: Option<DateTime<Utc>>,
    pub next_check_at: DateTime<Utc>,
}

/// Values required to subscribe a user to a feed
#[derive(Debug, Clone, Default)]
pub struct NewFeed {
    pub user_id: i64,
    pub feed_url: String,
    pub title: String,
    pub category_id: Option<i64>,
}

/// A feed item.
///
/// `(feed_id, hash)` identifies one logical item within a feed. Freshly parsed
/// entries have `id == 0` until the reconciler persists or matches them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub hash: String,
    pub status: EntryStatus,
    pub starred: bool,
    pub title: String,
    pub url: String,
    pub comments_url: String,
    pub content: String,
    pub author: String,
    /// Estimated reading time in minutes
    pub reading_time: i64,
    pub tags: Vec<String>,
    pub extra: EntryExtra,
    pub share_code: String,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
}

/// One feed's scheduled polling unit handed to the worker pool
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Job {
    pub user_id: i64,
    pub feed_id: i64,
    pub feed_url: String,
}

/// Outcome of one feed refresh.
///
/// `created` holds the persisted entries that count as new unread items;
/// entries deduplicated against another feed are persisted as read and only
/// counted in `deduplicated`. `updated` holds every entry matched against a
/// stored row of this feed, whether or not it was rewritten.
#[derive(Debug, Clone, Default)]
pub struct FeedRefreshed {
    pub created: Vec<Entry>,
    pub updated: Vec<Entry>,
    pub deduplicated: usize,
}

impl FeedRefreshed {
    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Column list matching [`EntryDbRow`]
pub(crate) const ENTRY_COLUMNS: &str = "id, user_id, feed_id, hash, status, starred, title, url, \
     comments_url, content, author, reading_time, tags, extra, share_code, published_at, \
     created_at, changed_at";

/// Internal row type for Entry queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryDbRow {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub hash: String,
    pub status: String,
    pub starred: bool,
    pub title: String,
    pub url: String,
    pub comments_url: String,
    pub content: String,
    pub author: String,
    pub reading_time: i64,
    pub tags: String,
    pub extra: String,
    pub share_code: String,
    pub published_at: i64,
    pub created_at: i64,
    pub changed_at: i64,
}

impl EntryDbRow {
    pub(crate) fn into_entry(self) -> Result<Entry, DatabaseError> {
        let tags: Vec<String> = serde_json::from_str(&self.tags).map_err(|e| {
            DatabaseError::Decode(format!("tags of entry #{}: {e}", self.id))
        })?;
        let extra: EntryExtra = serde_json::from_str(&self.extra).map_err(|e| {
            DatabaseError::Decode(format!("extra of entry #{}: {e}", self.id))
        })?;

        Ok(Entry {
            id: self.id,
            user_id: self.user_id,
            feed_id: self.feed_id,
            hash: self.hash,
            status: self.status.parse()?,
            starred: self.starred,
            title: self.title,
            url: self.url,
            comments_url: self.comments_url,
            content: self.content,
            author: self.author,
            reading_time: self.reading_time,
            tags,
            extra,
            share_code: self.share_code,
            published_at: from_millis(self.published_at),
            created_at: from_millis(self.created_at),
            changed_at: from_millis(self.changed_at),
        })
    }
}

/// Column list matching [`FeedDbRow`]
pub(crate) const FEED_COLUMNS: &str = "id, user_id, feed_url, title, category_id, disabled, \
     parsing_error_count, parsing_error_msg, checked_at, next_check_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub user_id: i64,
    pub feed_url: String,
    pub title: String,
    pub category_id: Option<i64>,
    pub disabled: bool,
    pub parsing_error_count: i64,
    pub parsing_error_msg: String,
    pub checked_at: Option<i64>,
    pub next_check_at: i64,
}

impl From<FeedDbRow> for Feed {
    fn from(row: FeedDbRow) -> Self {
        Feed {
            id: row.id,
            user_id: row.user_id,
            feed_url: row.feed_url,
            title: row.title,
            category_id: row.category_id,
            disabled: row.disabled,
            parsing_error_count: row.parsing_error_count,
            parsing_error_msg: row.parsing_error_msg,
            checked_at: row.checked_at.map(from_millis),
            next_check_at: from_millis(row.next_check_at),
        }
    }
}

/// Stored state the reconciler needs to match an incoming hash
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredEntry {
    pub id: i64,
    pub feed_id: i64,
    pub hash: String,
    pub status: String,
    pub starred: bool,
    pub share_code: String,
    pub published_at: i64,
    pub created_at: i64,
    pub changed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_status_round_trips_through_text() {
        for status in [EntryStatus::Unread, EntryStatus::Read, EntryStatus::Removed] {
            assert_eq!(status.as_str().parse::<EntryStatus>().unwrap(), status);
        }
        assert!(matches!(
            "archived".parse::<EntryStatus>(),
            Err(DatabaseError::Decode(_))
        ));
    }

    #[test]
    fn test_context_wraps_message() {
        let err = DatabaseError::Decode("bad".into()).context("unable to refresh feed #7 entries");
        assert_eq!(
            err.to_string(),
            "unable to refresh feed #7 entries: Invalid stored value: bad"
        );
    }

    #[test]
    fn test_millis_truncate_sub_millisecond_precision() {
        let t = now();
        assert_eq!(from_millis(to_millis(t)), t);
    }
}
