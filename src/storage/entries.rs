use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::bulk::{create_entries, normalize_tags, to_json};
use super::matching::{classify, drop_repeated_hashes, select_owners, Classified};
use super::schema::Database;
use super::types::{
    from_millis, now, to_millis, DatabaseError, Entry, EntryDbRow, EntryStatus, FeedRefreshed,
    StoredEntry, ENTRY_COLUMNS,
};
use crate::dedup::DedupFilter;

impl Database {
    // ========================================================================
    // Feed Refresh
    // ========================================================================

    /// Reconcile one feed's freshly parsed entries with what is stored.
    ///
    /// Entries are stamped with the user and feed and forced to unread. Inside
    /// one transaction each entry is matched against the user's stored rows:
    /// matches in this feed become updates (persisted only when
    /// `update_existing` is set), everything else is created after passing
    /// through `dedup`. Afterwards, removed entries of this feed whose hash is
    /// no longer in the feed are deleted; this also runs for an empty fetch.
    ///
    /// On error nothing from the transaction is persisted. Dropping the
    /// returned future before completion rolls the transaction back.
    pub async fn refresh_feed_entries(
        &self,
        dedup: &dyn DedupFilter,
        user_id: i64,
        feed_id: i64,
        entries: Vec<Entry>,
        update_existing: bool,
    ) -> Result<FeedRefreshed, DatabaseError> {
        let wrap = |e: DatabaseError| e.context(format!("unable to refresh feed #{feed_id} entries"));

        let mut entries = entries;
        for entry in entries.iter_mut() {
            entry.user_id = user_id;
            entry.feed_id = feed_id;
            entry.status = EntryStatus::Unread;
            entry.published_at = from_millis(to_millis(entry.published_at));
        }

        let (entries, dropped) = drop_repeated_hashes(entries);
        if dropped > 0 {
            tracing::debug!(feed_id, dropped, "Dropped entries repeating a hash within one fetch");
        }
        let hashes: Vec<String> = entries.iter().map(|e| e.hash.clone()).collect();

        let refreshed = if entries.is_empty() {
            FeedRefreshed::default()
        } else {
            self.reconcile(dedup, user_id, feed_id, entries, update_existing)
                .await
                .map_err(wrap)?
        };

        self.cleanup_removed_entries(feed_id, &hashes)
            .await
            .map_err(wrap)?;

        if refreshed.deduplicated > 0 {
            tracing::debug!(
                feed_id,
                deduplicated = refreshed.deduplicated,
                "Entries already seen in another feed stored as read"
            );
        }

        Ok(refreshed)
    }

    async fn reconcile(
        &self,
        dedup: &dyn DedupFilter,
        user_id: i64,
        feed_id: i64,
        entries: Vec<Entry>,
        update_existing: bool,
    ) -> Result<FeedRefreshed, DatabaseError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DatabaseError::query("storage: unable to start transaction", e))?;

        // Take the write lock before reading so a concurrent refresh waits on
        // busy_timeout instead of failing to upgrade its read lock.
        let owned = sqlx::query("UPDATE feeds SET checked_at = checked_at WHERE id = ? AND user_id = ?")
            .bind(feed_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::query(format!("storage: unable to lock feed #{feed_id}"), e))?;
        if owned.rows_affected() == 0 {
            return Err(DatabaseError::FeedNotFound { user_id, feed_id });
        }

        let stored = {
            let hashes: Vec<&str> = entries.iter().map(|e| e.hash.as_str()).collect();
            stored_entries_by_hash(&mut tx, user_id, &hashes).await?
        };
        let owners = select_owners(stored, feed_id);
        let Classified {
            mut creations,
            mut updates,
            foreign_owners,
        } = classify(entries, &owners, feed_id)?;

        for (hash, owner) in &foreign_owners {
            dedup.remember(user_id, hash, *owner);
        }
        let hashes: Vec<String> = creations.iter().map(|e| e.hash.clone()).collect();
        let outcome = dedup.filter(user_id, &mut creations);
        // Creations still unread are the ones this refresh may have registered
        let mut registered = PendingRegistrations {
            dedup,
            user_id,
            feed_id,
            hashes: hashes
                .into_iter()
                .zip(creations.iter())
                .filter(|(_, e)| e.status == EntryStatus::Unread)
                .map(|(hash, _)| hash)
                .collect(),
        };

        if update_existing {
            for entry in updates.iter_mut() {
                update_entry(&mut tx, entry).await?;
            }
        }

        create_entries(&mut tx, &mut creations, self.bulk_threshold).await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::query("storage: unable to commit transaction", e))?;
        registered.hashes.clear();

        let (created, _read): (Vec<Entry>, Vec<Entry>) = creations
            .into_iter()
            .partition(|e| e.status == EntryStatus::Unread);

        Ok(FeedRefreshed {
            created,
            updated: updates,
            deduplicated: outcome.deduplicated,
        })
    }

    /// Delete removed, unstarred entries of a feed whose hash is not in `keep`.
    ///
    /// With an empty `keep` every removed, unstarred entry of the feed goes.
    pub async fn cleanup_removed_entries(
        &self,
        feed_id: i64,
        keep: &[String],
    ) -> Result<u64, DatabaseError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM entries WHERE feed_id = ");
        builder
            .push_bind(feed_id)
            .push(" AND status = ")
            .push_bind(EntryStatus::Removed.as_str())
            .push(" AND starred = 0");
        if !keep.is_empty() {
            builder
                .push(" AND hash NOT IN (SELECT value FROM json_each(")
                .push_bind(to_json(keep, "entry hashes")?)
                .push("))");
        }

        let result = builder.build().execute(&self.pool).await.map_err(|e| {
            DatabaseError::query(
                format!("storage: unable to clean up removed entries of feed #{feed_id}"),
                e,
            )
        })?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Entry Queries
    // ========================================================================

    pub async fn entries_for_feed(&self, feed_id: i64) -> Result<Vec<Entry>, DatabaseError> {
        let rows: Vec<EntryDbRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id = ? ORDER BY id"
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            DatabaseError::query(format!("storage: unable to fetch entries of feed #{feed_id}"), e)
        })?;
        rows.into_iter().map(EntryDbRow::into_entry).collect()
    }

    pub async fn entry_by_hash(
        &self,
        feed_id: i64,
        hash: &str,
    ) -> Result<Option<Entry>, DatabaseError> {
        let row: Option<EntryDbRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id = ? AND hash = ?"
        ))
        .bind(feed_id)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            DatabaseError::query(format!("storage: unable to fetch entry of feed #{feed_id}"), e)
        })?;
        row.map(EntryDbRow::into_entry).transpose()
    }

    pub async fn count_unread_entries(&self, user_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entries WHERE user_id = ? AND status = 'unread'")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    DatabaseError::query(
                        format!("storage: unable to count unread entries of user #{user_id}"),
                        e,
                    )
                })?;
        Ok(count)
    }

    // ========================================================================
    // Entry State
    // ========================================================================

    /// Set the status of the given entries of a user. Returns rows changed.
    pub async fn set_entries_status(
        &self,
        user_id: i64,
        entry_ids: &[i64],
        status: EntryStatus,
    ) -> Result<u64, DatabaseError> {
        if entry_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE entries SET status = ?, changed_at = MAX(?, changed_at + 1)
             WHERE user_id = ? AND id IN (SELECT value FROM json_each(?))",
        )
        .bind(status.as_str())
        .bind(to_millis(now()))
        .bind(user_id)
        .bind(to_json(entry_ids, "entry ids")?)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::query("storage: unable to update entries status", e))?;
        Ok(result.rows_affected())
    }

    /// Star or unstar the given entries of a user. Returns rows changed.
    pub async fn set_entries_starred(
        &self,
        user_id: i64,
        entry_ids: &[i64],
        starred: bool,
    ) -> Result<u64, DatabaseError> {
        if entry_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE entries SET starred = ?, changed_at = MAX(?, changed_at + 1)
             WHERE user_id = ? AND id IN (SELECT value FROM json_each(?))",
        )
        .bind(starred)
        .bind(to_millis(now()))
        .bind(user_id)
        .bind(to_json(entry_ids, "entry ids")?)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::query("storage: unable to star entries", e))?;
        Ok(result.rows_affected())
    }

    /// Mark every read entry of a user as removed, except starred or shared
    /// ones. Removed entries are purged by later refreshes once they leave
    /// their feed.
    pub async fn flush_history(&self, user_id: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE entries SET status = 'removed', changed_at = MAX(?, changed_at + 1)
             WHERE user_id = ? AND status = 'read' AND starred = 0 AND share_code = ''",
        )
        .bind(to_millis(now()))
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DatabaseError::query(format!("storage: unable to flush history of user #{user_id}"), e)
        })?;
        Ok(result.rows_affected())
    }
}

/// Dedup registrations made by a refresh that has not committed yet.
///
/// Dropped before being cleared (error return or cancelled future), it hands
/// the hashes back to the registry so a rolled-back creation does not mark
/// the same content read in another feed.
struct PendingRegistrations<'a> {
    dedup: &'a dyn DedupFilter,
    user_id: i64,
    feed_id: i64,
    hashes: Vec<String>,
}

impl Drop for PendingRegistrations<'_> {
    fn drop(&mut self) {
        for hash in &self.hashes {
            self.dedup.forget(self.user_id, hash, self.feed_id);
        }
    }
}

/// Stored rows of `user_id` sharing a hash with `hashes`, ordered by id.
async fn stored_entries_by_hash(
    conn: &mut SqliteConnection,
    user_id: i64,
    hashes: &[&str],
) -> Result<Vec<StoredEntry>, DatabaseError> {
    sqlx::query_as(
        "SELECT id, feed_id, hash, status, starred, share_code, published_at, created_at, changed_at
         FROM entries
         WHERE user_id = ? AND hash IN (SELECT value FROM json_each(?))
         ORDER BY id",
    )
    .bind(user_id)
    .bind(to_json(hashes, "entry hashes")?)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        DatabaseError::query(
            format!("storage: unable to fetch stored entries of user #{user_id}"),
            e,
        )
    })
}

/// Rewrite the mutable fields of a matched entry.
///
/// Status, starred and published_at are left as stored. changed_at strictly
/// advances even within one millisecond.
async fn update_entry(conn: &mut SqliteConnection, entry: &mut Entry) -> Result<(), DatabaseError> {
    entry.tags = normalize_tags(&entry.tags);

    let (changed_at,): (i64,) = sqlx::query_as(
        "UPDATE entries SET
            title = ?, url = ?, comments_url = ?, content = ?, author = ?,
            reading_time = ?, tags = ?, extra = ?,
            changed_at = MAX(?, changed_at + 1)
         WHERE user_id = ? AND feed_id = ? AND hash = ?
         RETURNING changed_at",
    )
    .bind(&entry.title)
    .bind(&entry.url)
    .bind(&entry.comments_url)
    .bind(&entry.content)
    .bind(&entry.author)
    .bind(entry.reading_time)
    .bind(to_json(&entry.tags, "entry tags")?)
    .bind(to_json(&entry.extra, "entry extra")?)
    .bind(to_millis(now()))
    .bind(entry.user_id)
    .bind(entry.feed_id)
    .bind(&entry.hash)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        DatabaseError::query(
            format!("storage: unable to update entry {:?} (feed #{})", entry.url, entry.feed_id),
            e,
        )
    })?;

    entry.changed_at = from_millis(changed_at);
    Ok(())
}
