//! Insertion of newly created entries.
//!
//! Small batches are written one `INSERT … RETURNING` at a time. Larger
//! batches are loaded with multi-row inserts and the generated columns are read
//! back in a single correlating query keyed by `(feed_id, hash)`. Both paths run
//! on the caller's connection, normally the reconciler's transaction, so a
//! failure anywhere leaves nothing behind once the transaction is dropped.

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::{HashMap, HashSet};

use super::types::{from_millis, now, to_millis, DatabaseError, Entry};

/// Batch size from which the bulk-load path is used.
pub(crate) const DEFAULT_BULK_THRESHOLD: usize = 3;

// 17 parameters per row keeps each statement under SQLite's historical
// 999-parameter limit.
const BULK_CHUNK_ROWS: usize = 50;

const INSERT_COLUMNS: &str = "user_id, feed_id, hash, status, starred, title, url, comments_url, \
     content, author, reading_time, tags, extra, share_code, published_at, created_at, changed_at";

/// Trim tags, drop blank ones and keep the first occurrence of each.
pub(crate) fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty() && seen.insert(*tag))
        .map(str::to_string)
        .collect()
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Encode(format!("{what}: {e}")))
}

/// JSON columns of one entry, encoded before any statement is built.
struct EncodedColumns {
    tags: String,
    extra: String,
}

impl EncodedColumns {
    fn of(entry: &Entry) -> Result<Self, DatabaseError> {
        Ok(Self {
            tags: to_json(&entry.tags, "entry tags")?,
            extra: to_json(&entry.extra, "entry extra")?,
        })
    }
}

/// Persist `entries` and fill in their `id`, `created_at` and `changed_at`.
///
/// All entries must belong to the same feed. Batches shorter than `threshold`
/// take the row-by-row path.
pub(crate) async fn create_entries(
    conn: &mut SqliteConnection,
    entries: &mut [Entry],
    threshold: usize,
) -> Result<(), DatabaseError> {
    if entries.is_empty() {
        return Ok(());
    }

    let stamp = now();
    for entry in entries.iter_mut() {
        entry.tags = normalize_tags(&entry.tags);
        entry.created_at = stamp;
        entry.changed_at = stamp;
    }

    if entries.len() < threshold {
        insert_rows(conn, entries).await
    } else {
        bulk_load(conn, entries).await
    }
}

async fn insert_rows(conn: &mut SqliteConnection, entries: &mut [Entry]) -> Result<(), DatabaseError> {
    let sql = format!(
        "INSERT INTO entries ({INSERT_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING id, created_at, changed_at"
    );

    for entry in entries.iter_mut() {
        let encoded = EncodedColumns::of(entry)?;
        let (id, created_at, changed_at): (i64, i64, i64) = sqlx::query_as(&sql)
            .bind(entry.user_id)
            .bind(entry.feed_id)
            .bind(&entry.hash)
            .bind(entry.status.as_str())
            .bind(entry.starred)
            .bind(&entry.title)
            .bind(&entry.url)
            .bind(&entry.comments_url)
            .bind(&entry.content)
            .bind(&entry.author)
            .bind(entry.reading_time)
            .bind(&encoded.tags)
            .bind(&encoded.extra)
            .bind(&entry.share_code)
            .bind(to_millis(entry.published_at))
            .bind(to_millis(entry.created_at))
            .bind(to_millis(entry.changed_at))
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                DatabaseError::query(
                    format!(
                        "storage: unable to create entry {:?} (feed #{})",
                        entry.url, entry.feed_id
                    ),
                    e,
                )
            })?;

        entry.id = id;
        entry.created_at = from_millis(created_at);
        entry.changed_at = from_millis(changed_at);
    }

    Ok(())
}

async fn bulk_load(conn: &mut SqliteConnection, entries: &mut [Entry]) -> Result<(), DatabaseError> {
    let feed_id = entries[0].feed_id;
    let encoded = entries
        .iter()
        .map(EncodedColumns::of)
        .collect::<Result<Vec<_>, _>>()?;

    {
        let rows: Vec<(&Entry, &EncodedColumns)> = entries.iter().zip(encoded.iter()).collect();
        for chunk in rows.chunks(BULK_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO entries ({INSERT_COLUMNS}) "));

            builder.push_values(chunk, |mut b, (entry, columns)| {
                b.push_bind(entry.user_id)
                    .push_bind(entry.feed_id)
                    .push_bind(&entry.hash)
                    .push_bind(entry.status.as_str())
                    .push_bind(entry.starred)
                    .push_bind(&entry.title)
                    .push_bind(&entry.url)
                    .push_bind(&entry.comments_url)
                    .push_bind(&entry.content)
                    .push_bind(&entry.author)
                    .push_bind(entry.reading_time)
                    .push_bind(&columns.tags)
                    .push_bind(&columns.extra)
                    .push_bind(&entry.share_code)
                    .push_bind(to_millis(entry.published_at))
                    .push_bind(to_millis(entry.created_at))
                    .push_bind(to_millis(entry.changed_at));
            });

            builder.build().execute(&mut *conn).await.map_err(|e| {
                DatabaseError::query(
                    format!("storage: unable to bulk load entries of feed #{feed_id}"),
                    e,
                )
            })?;
        }
    }

    // Read the generated columns back by hash
    let hashes = to_json(
        &entries.iter().map(|e| e.hash.as_str()).collect::<Vec<_>>(),
        "entry hashes",
    )?;
    let generated: Vec<(i64, String, i64, i64)> = sqlx::query_as(
        "SELECT id, hash, created_at, changed_at FROM entries
         WHERE feed_id = ? AND hash IN (SELECT value FROM json_each(?))",
    )
    .bind(feed_id)
    .bind(hashes)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        DatabaseError::query(
            format!("storage: unable to read back entries of feed #{feed_id}"),
            e,
        )
    })?;

    let by_hash: HashMap<String, (i64, i64, i64)> = generated
        .into_iter()
        .map(|(id, hash, created_at, changed_at)| (hash, (id, created_at, changed_at)))
        .collect();

    let mut missing = 0;
    for entry in entries.iter_mut() {
        match by_hash.get(&entry.hash) {
            Some(&(id, created_at, changed_at)) if entry.feed_id == feed_id => {
                entry.id = id;
                entry.created_at = from_millis(created_at);
                entry.changed_at = from_millis(changed_at);
            }
            _ => missing += 1,
        }
    }

    if missing > 0 {
        return Err(DatabaseError::Correlation { feed_id, missing });
    }

    Ok(())
}
