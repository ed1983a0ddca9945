use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use super::schema::Database;
use super::types::{now, to_millis, DatabaseError, Feed, FeedDbRow, NewFeed, FEED_COLUMNS};

/// Next poll time for a feed checked at `now`.
///
/// Intervals too large for chrono saturate to one day.
pub fn next_check_after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(interval).unwrap_or_else(|_| TimeDelta::days(1));
    now.checked_add_signed(delta).unwrap_or(now)
}

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Subscribe a user to a feed. New feeds are due immediately.
    pub async fn create_feed(&self, feed: &NewFeed) -> Result<i64, DatabaseError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO feeds (user_id, feed_url, title, category_id, next_check_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(feed.user_id)
        .bind(&feed.feed_url)
        .bind(&feed.title)
        .bind(feed.category_id)
        .bind(to_millis(now()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::query("storage: unable to create feed", e))?;
        Ok(id)
    }

    pub async fn feed_by_id(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    DatabaseError::query(format!("storage: unable to fetch feed #{feed_id}"), e)
                })?;
        Ok(row.map(Feed::from))
    }

    pub async fn feeds_for_user(&self, user_id: i64) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE user_id = ? ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            DatabaseError::query(format!("storage: unable to fetch feeds of user #{user_id}"), e)
        })?;
        Ok(rows.into_iter().map(Feed::from).collect())
    }

    /// Returns false if the feed does not exist.
    pub async fn set_feed_disabled(&self, feed_id: i64, disabled: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE feeds SET disabled = ? WHERE id = ?")
            .bind(disabled)
            .bind(feed_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                DatabaseError::query(format!("storage: unable to update feed #{feed_id}"), e)
            })?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Poll Bookkeeping
    // ========================================================================

    /// Record a successful poll: clear the error state and schedule the next check.
    pub async fn record_refresh_success(
        &self,
        feed_id: i64,
        checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE feeds SET parsing_error_count = 0, parsing_error_msg = '',
             checked_at = ?, next_check_at = ? WHERE id = ?",
        )
        .bind(to_millis(checked_at))
        .bind(to_millis(next_check_at))
        .bind(feed_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DatabaseError::query(format!("storage: unable to update feed #{feed_id} runtime"), e)
        })?;
        Ok(())
    }

    /// Record a failed poll. Returns the new parsing error count.
    ///
    /// The next check still advances so a failing feed is retried on schedule
    /// until the error limit filters it out.
    pub async fn record_refresh_failure(
        &self,
        feed_id: i64,
        message: &str,
        checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            "UPDATE feeds SET parsing_error_count = parsing_error_count + 1,
             parsing_error_msg = ?, checked_at = ?, next_check_at = ?
             WHERE id = ? RETURNING parsing_error_count",
        )
        .bind(message)
        .bind(to_millis(checked_at))
        .bind(to_millis(next_check_at))
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            DatabaseError::query(
                format!("storage: unable to increment error count of feed #{feed_id}"),
                e,
            )
        })?;
        Ok(count)
    }
}
