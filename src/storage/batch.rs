//! Scheduler queries: select feeds due for polling and reset their schedule.
//!
//! Filters are additive and optional. A filter that was never added is absent
//! from the WHERE clause; `with_error_limit(0)` adds nothing rather than
//! excluding every feed. [`BatchBuilder::fetch_jobs`] and
//! [`BatchBuilder::reset_next_check_at`] render their conditions through the
//! same function so a manual "refresh now" touches exactly the feeds a
//! scheduler pass with the same filters would select.

use sqlx::{QueryBuilder, Sqlite};

use super::schema::Database;
use super::types::{now, to_millis, DatabaseError, Job};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    UserId(i64),
    CategoryId(i64),
    ErrorLimit(i64),
    NextCheckExpired,
    WithoutDisabled,
}

/// Fluent builder over the `feeds` table.
#[derive(Clone)]
pub struct BatchBuilder<'a> {
    db: &'a Database,
    conditions: Vec<Condition>,
    limit: usize,
}

impl Database {
    pub fn new_batch_builder(&self) -> BatchBuilder<'_> {
        BatchBuilder {
            db: self,
            conditions: Vec::new(),
            limit: 0,
        }
    }
}

impl<'a> BatchBuilder<'a> {
    /// Cap the number of jobs returned. 0 means uncapped.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.limit = batch_size;
        self
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.conditions.push(Condition::UserId(user_id));
        self
    }

    pub fn with_category_id(mut self, category_id: i64) -> Self {
        self.conditions.push(Condition::CategoryId(category_id));
        self
    }

    /// Keep feeds whose parsing error count is below `limit`.
    /// A limit of 0 or less disables the filter.
    pub fn with_error_limit(mut self, limit: i64) -> Self {
        if limit > 0 {
            self.conditions.push(Condition::ErrorLimit(limit));
        }
        self
    }

    pub fn with_next_check_expired(mut self) -> Self {
        self.conditions.push(Condition::NextCheckExpired);
        self
    }

    pub fn without_disabled_feeds(mut self) -> Self {
        self.conditions.push(Condition::WithoutDisabled);
        self
    }

    /// Append the WHERE clause. `now_ms` is captured once per statement.
    fn push_conditions(&self, builder: &mut QueryBuilder<'_, Sqlite>, now_ms: i64) {
        if self.conditions.is_empty() {
            return;
        }

        builder.push(" WHERE ");
        for (i, condition) in self.conditions.iter().enumerate() {
            if i > 0 {
                builder.push(" AND ");
            }
            match *condition {
                Condition::UserId(user_id) => {
                    builder.push("user_id = ").push_bind(user_id);
                }
                Condition::CategoryId(category_id) => {
                    builder.push("category_id = ").push_bind(category_id);
                }
                Condition::ErrorLimit(limit) => {
                    builder.push("parsing_error_count < ").push_bind(limit);
                }
                Condition::NextCheckExpired => {
                    builder.push("next_check_at <= ").push_bind(now_ms);
                }
                Condition::WithoutDisabled => {
                    builder.push("disabled = 0");
                }
            }
        }
    }

    /// Select the matching feeds, oldest `next_check_at` first.
    ///
    /// Either every matching job is returned or an error; never a partial list.
    pub async fn fetch_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let now_ms = to_millis(now());
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT user_id, id AS feed_id, feed_url FROM feeds");
        self.push_conditions(&mut builder, now_ms);
        builder.push(" ORDER BY next_check_at ASC, id ASC");
        if self.limit > 0 {
            let limit = i64::try_from(self.limit).unwrap_or(i64::MAX);
            builder.push(" LIMIT ").push_bind(limit);
        }

        builder
            .build_query_as::<Job>()
            .fetch_all(&self.db.pool)
            .await
            .map_err(|e| DatabaseError::query("storage: unable to fetch batch of jobs", e))
    }

    /// Clear error state and make every matching feed due now.
    ///
    /// Returns the number of feeds reset. The batch size does not apply.
    pub async fn reset_next_check_at(&self) -> Result<u64, DatabaseError> {
        let now_ms = to_millis(now());
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE feeds SET parsing_error_count = 0, parsing_error_msg = '', next_check_at = ",
        );
        builder.push_bind(now_ms);
        self.push_conditions(&mut builder, now_ms);

        let result = builder
            .build()
            .execute(&self.db.pool)
            .await
            .map_err(|e| DatabaseError::query("storage: failed reset next check", e))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{next_check_after, Database, NewFeed};
    use chrono::Utc;
    use std::time::Duration;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn add_feed(db: &Database, user_id: i64, n: i64, category_id: Option<i64>) -> i64 {
        db.create_feed(&NewFeed {
            user_id,
            feed_url: format!("https://feed{}.example.com/rss", n),
            title: format!("Feed {}", n),
            category_id,
        })
        .await
        .unwrap()
    }

    async fn fail_times(db: &Database, feed_id: i64, times: usize) {
        let now = Utc::now();
        for _ in 0..times {
            db.record_refresh_failure(feed_id, "boom", now, now)
                .await
                .unwrap();
        }
    }

    fn ids(jobs: &[crate::storage::Job]) -> Vec<i64> {
        jobs.iter().map(|j| j.feed_id).collect()
    }

    #[tokio::test]
    async fn test_no_filters_selects_every_feed() {
        let db = test_db().await;
        let a = add_feed(&db, 1, 1, None).await;
        let b = add_feed(&db, 2, 2, None).await;

        let jobs = db.new_batch_builder().fetch_jobs().await.unwrap();
        assert_eq!(ids(&jobs), vec![a, b]);
        assert_eq!(jobs[0].user_id, 1);
        assert_eq!(jobs[0].feed_url, "https://feed1.example.com/rss");
    }

    #[tokio::test]
    async fn test_error_limit_excludes_feeds_at_threshold() {
        let db = test_db().await;
        let healthy = add_feed(&db, 1, 1, None).await;
        let failing = add_feed(&db, 1, 2, None).await;
        let broken = add_feed(&db, 1, 3, None).await;
        fail_times(&db, failing, 2).await;
        fail_times(&db, broken, 3).await;

        let jobs = db
            .new_batch_builder()
            .with_error_limit(3)
            .fetch_jobs()
            .await
            .unwrap();
        let mut selected = ids(&jobs);
        selected.sort();
        assert_eq!(selected, vec![healthy, failing]);
    }

    #[tokio::test]
    async fn test_error_limit_zero_disables_filter() {
        let db = test_db().await;
        let a = add_feed(&db, 1, 1, None).await;
        fail_times(&db, a, 10).await;

        let jobs = db
            .new_batch_builder()
            .with_error_limit(0)
            .fetch_jobs()
            .await
            .unwrap();
        assert_eq!(ids(&jobs), vec![a]);
    }

    #[tokio::test]
    async fn test_user_and_category_filters_compose() {
        let db = test_db().await;
        let wanted = add_feed(&db, 1, 1, Some(10)).await;
        let _other_category = add_feed(&db, 1, 2, Some(11)).await;
        let _other_user = add_feed(&db, 2, 3, Some(10)).await;

        let jobs = db
            .new_batch_builder()
            .with_user_id(1)
            .with_category_id(10)
            .fetch_jobs()
            .await
            .unwrap();
        assert_eq!(ids(&jobs), vec![wanted]);
    }

    #[tokio::test]
    async fn test_without_disabled_feeds() {
        let db = test_db().await;
        let enabled = add_feed(&db, 1, 1, None).await;
        let disabled = add_feed(&db, 1, 2, None).await;
        db.set_feed_disabled(disabled, true).await.unwrap();

        let jobs = db
            .new_batch_builder()
            .without_disabled_feeds()
            .fetch_jobs()
            .await
            .unwrap();
        assert_eq!(ids(&jobs), vec![enabled]);
    }

    #[tokio::test]
    async fn test_next_check_expired_orders_oldest_first_and_caps() {
        let db = test_db().await;
        let a = add_feed(&db, 1, 1, None).await;
        let b = add_feed(&db, 1, 2, None).await;
        let c = add_feed(&db, 1, 3, None).await;
        let d = add_feed(&db, 1, 4, None).await;

        let now = Utc::now();
        let hour = chrono::Duration::hours(1);
        db.record_refresh_success(a, now, now - hour).await.unwrap();
        db.record_refresh_success(b, now, now - hour * 3).await.unwrap();
        db.record_refresh_success(c, now, now - hour * 2).await.unwrap();
        // Not due yet
        db.record_refresh_success(d, now, next_check_after(now, Duration::from_secs(3600)))
            .await
            .unwrap();

        let jobs = db
            .new_batch_builder()
            .with_next_check_expired()
            .fetch_jobs()
            .await
            .unwrap();
        assert_eq!(ids(&jobs), vec![b, c, a]);

        let capped = db
            .new_batch_builder()
            .with_next_check_expired()
            .with_batch_size(2)
            .fetch_jobs()
            .await
            .unwrap();
        assert_eq!(ids(&capped), vec![b, c]);
    }

    #[tokio::test]
    async fn test_reset_next_check_at_uses_same_filters() {
        let db = test_db().await;
        let mine = add_feed(&db, 1, 1, None).await;
        let theirs = add_feed(&db, 2, 2, None).await;

        let later = next_check_after(Utc::now(), Duration::from_secs(3600));
        for id in [mine, theirs] {
            db.record_refresh_failure(id, "timeout", Utc::now(), later)
                .await
                .unwrap();
        }

        let reset = db
            .new_batch_builder()
            .with_user_id(1)
            .reset_next_check_at()
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let mine = db.feed_by_id(mine).await.unwrap().unwrap();
        assert_eq!(mine.parsing_error_count, 0);
        assert_eq!(mine.parsing_error_msg, "");
        assert!(mine.next_check_at <= Utc::now());

        let theirs = db.feed_by_id(theirs).await.unwrap().unwrap();
        assert_eq!(theirs.parsing_error_count, 1);
        assert_eq!(theirs.next_check_at, later_truncated(later));

        let due = db
            .new_batch_builder()
            .with_next_check_expired()
            .fetch_jobs()
            .await
            .unwrap();
        assert_eq!(ids(&due), vec![mine.id]);
    }

    fn later_truncated(t: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        chrono::DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap()
    }
}
