use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::bulk::DEFAULT_BULK_THRESHOLD;
use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    /// Batches at least this large take the bulk-load insert path
    pub(crate) bulk_threshold: usize,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED).
    /// Returns `DatabaseError::CannotOpen` if the file cannot be opened or
    /// created (SQLITE_CANTOPEN), e.g. a missing parent directory.
    /// Returns `DatabaseError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: concurrent feed refreshes wait for the single
        // SQLite writer instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(10));
        // Shared-cache in-memory databases report table locks instead of
        // waiting on busy_timeout, so they get a single connection. The
        // database lives only as long as that connection, so it is never reaped.
        let pool_options = if path == ":memory:" {
            pool_options
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            pool_options.max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::from_open_error(path, e))?;
        let db = Self {
            pool,
            bulk_threshold: DEFAULT_BULK_THRESHOLD,
        };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::InstanceLocked => DatabaseError::InstanceLocked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        Ok(db)
    }

    /// Set the batch size from which new entries are bulk-loaded instead of
    /// inserted row by row. Values below 1 are treated as 1.
    pub fn with_bulk_threshold(mut self, threshold: usize) -> Self {
        self.bulk_threshold = threshold.max(1);
        self
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                feed_url TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                category_id INTEGER,
                disabled INTEGER NOT NULL DEFAULT 0,
                parsing_error_count INTEGER NOT NULL DEFAULT 0,
                parsing_error_msg TEXT NOT NULL DEFAULT '',
                checked_at INTEGER,
                next_check_at INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, feed_url)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'unread'
                    CHECK (status IN ('unread', 'read', 'removed')),
                starred INTEGER NOT NULL DEFAULT 0,
                title TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                comments_url TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                reading_time INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                extra TEXT NOT NULL DEFAULT '{}',
                share_code TEXT NOT NULL DEFAULT '',
                published_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                changed_at INTEGER NOT NULL,
                UNIQUE(feed_id, hash)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Cross-feed matching looks entries up by (user_id, hash)
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_user_hash ON entries(user_id, hash)")
            .execute(&mut *tx)
            .await?;

        // Cleanup scans one feed's removed entries
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_status ON entries(feed_id, status)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_user_status ON entries(user_id, status)",
        )
        .execute(&mut *tx)
        .await?;

        // Scheduler orders due feeds by next_check_at
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feeds_next_check ON feeds(next_check_at, id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
