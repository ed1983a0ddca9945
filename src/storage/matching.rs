//! Matching freshly parsed entries against stored rows.
//!
//! The lookup for a refresh loads every stored entry of the *user* sharing an
//! incoming hash, so one hash can come back with rows from several feeds. The
//! functions here decide which row an incoming entry belongs to; they do no I/O
//! and are tested on their own.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};

use super::types::{from_millis, DatabaseError, Entry, StoredEntry};

/// Pick one owning row per hash.
///
/// `rows` must be ordered by id. The first row seen for a hash wins unless a
/// later row belongs to `feed_id`, in which case the earliest such row wins.
/// A row of another feed must never shadow this feed's own entry, or the
/// refresh would rewrite the wrong feed's item.
pub fn select_owners(rows: Vec<StoredEntry>, feed_id: i64) -> HashMap<String, StoredEntry> {
    let mut owners: HashMap<String, StoredEntry> = HashMap::with_capacity(rows.len());
    for row in rows {
        match owners.entry(row.hash.clone()) {
            MapEntry::Vacant(slot) => {
                slot.insert(row);
            }
            MapEntry::Occupied(mut slot) => {
                if slot.get().feed_id != feed_id && row.feed_id == feed_id {
                    slot.insert(row);
                }
            }
        }
    }
    owners
}

/// Incoming entries split by what the refresh must do with them.
#[derive(Debug, Default)]
pub struct Classified {
    /// Entries with no stored row in this feed
    pub creations: Vec<Entry>,
    /// Entries matched to a stored row of this feed, carrying its identity
    pub updates: Vec<Entry>,
    /// `(hash, feed_id)` of creations whose hash is already stored in another feed
    pub foreign_owners: Vec<(String, i64)>,
}

/// Classify stamped entries against the owners chosen by [`select_owners`].
///
/// An update keeps the stored id, status, starred flag, share code, creation
/// and publication dates and last change; only the content comes from the feed.
pub fn classify(
    entries: Vec<Entry>,
    owners: &HashMap<String, StoredEntry>,
    feed_id: i64,
) -> Result<Classified, DatabaseError> {
    let mut classified = Classified::default();

    for mut entry in entries {
        match owners.get(&entry.hash) {
            Some(stored) if stored.feed_id == feed_id => {
                entry.id = stored.id;
                entry.status = stored.status.parse()?;
                entry.starred = stored.starred;
                entry.share_code = stored.share_code.clone();
                entry.published_at = from_millis(stored.published_at);
                entry.created_at = from_millis(stored.created_at);
                entry.changed_at = from_millis(stored.changed_at);
                classified.updates.push(entry);
            }
            Some(stored) => {
                classified
                    .foreign_owners
                    .push((entry.hash.clone(), stored.feed_id));
                classified.creations.push(entry);
            }
            None => classified.creations.push(entry),
        }
    }

    Ok(classified)
}

/// Drop entries repeating a hash seen earlier in the same batch.
///
/// Returns the kept entries in order and the number dropped.
pub fn drop_repeated_hashes(entries: Vec<Entry>) -> (Vec<Entry>, usize) {
    let total = entries.len();
    let mut seen = HashSet::with_capacity(total);
    let kept: Vec<Entry> = entries
        .into_iter()
        .filter(|entry| seen.insert(entry.hash.clone()))
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EntryStatus;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn stored(id: i64, feed_id: i64, hash: &str) -> StoredEntry {
        StoredEntry {
            id,
            feed_id,
            hash: hash.to_string(),
            status: "unread".to_string(),
            starred: false,
            share_code: String::new(),
            published_at: 1_000,
            created_at: 2_000,
            changed_at: 3_000,
        }
    }

    fn incoming(hash: &str) -> Entry {
        Entry {
            feed_id: 1,
            hash: hash.to_string(),
            title: format!("new {hash}"),
            published_at: from_millis(9_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_current_feed_wins_over_earlier_foreign_row() {
        let rows = vec![stored(10, 2, "h"), stored(11, 1, "h")];
        let owners = select_owners(rows, 1);
        assert_eq!(owners["h"].id, 11);
    }

    #[test]
    fn test_current_feed_row_is_not_replaced_by_foreign_row() {
        let rows = vec![stored(10, 1, "h"), stored(11, 2, "h")];
        let owners = select_owners(rows, 1);
        assert_eq!(owners["h"].id, 10);
    }

    #[test]
    fn test_first_foreign_row_wins_without_current_feed() {
        let rows = vec![stored(10, 3, "h"), stored(11, 2, "h")];
        let owners = select_owners(rows, 1);
        assert_eq!(owners["h"].id, 10);
    }

    #[test]
    fn test_classify_carries_stored_state_into_updates() {
        let mut row = stored(10, 1, "a");
        row.status = "read".to_string();
        row.starred = true;
        row.share_code = "abc".to_string();
        let owners = select_owners(vec![row, stored(11, 2, "b")], 1);

        let classified =
            classify(vec![incoming("a"), incoming("b"), incoming("c")], &owners, 1).unwrap();

        assert_eq!(classified.updates.len(), 1);
        let update = &classified.updates[0];
        assert_eq!(update.id, 10);
        assert_eq!(update.status, EntryStatus::Read);
        assert!(update.starred);
        assert_eq!(update.share_code, "abc");
        assert_eq!(update.published_at, from_millis(1_000));
        assert_eq!(update.created_at, from_millis(2_000));
        assert_eq!(update.title, "new a");

        let created: Vec<&str> = classified.creations.iter().map(|e| e.hash.as_str()).collect();
        assert_eq!(created, vec!["b", "c"]);
        assert!(classified.creations.iter().all(|e| e.id == 0));
        assert_eq!(classified.foreign_owners, vec![("b".to_string(), 2)]);
    }

    #[test]
    fn test_classify_rejects_unknown_status() {
        let mut row = stored(10, 1, "a");
        row.status = "archived".to_string();
        let owners = select_owners(vec![row], 1);
        assert!(matches!(
            classify(vec![incoming("a")], &owners, 1),
            Err(DatabaseError::Decode(_))
        ));
    }

    #[test]
    fn test_drop_repeated_hashes_keeps_first() {
        let mut second = incoming("a");
        second.title = "second".to_string();
        let (kept, dropped) = drop_repeated_hashes(vec![incoming("a"), incoming("b"), second]);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].title, "new a");
    }

    proptest! {
        #[test]
        fn prop_owner_is_earliest_current_row_else_earliest_row(
            specs in prop::collection::vec((1i64..4, 0usize..5), 0..40)
        ) {
            let rows: Vec<StoredEntry> = specs
                .iter()
                .enumerate()
                .map(|(i, (feed, h))| stored(i as i64 + 1, *feed, &format!("h{h}")))
                .collect();
            let owners = select_owners(rows.clone(), 1);

            let hashes: HashSet<&str> = rows.iter().map(|r| r.hash.as_str()).collect();
            prop_assert_eq!(owners.len(), hashes.len());

            for hash in hashes {
                let same_hash: Vec<&StoredEntry> = rows.iter().filter(|r| r.hash == hash).collect();
                let expected = same_hash
                    .iter()
                    .find(|r| r.feed_id == 1)
                    .or_else(|| same_hash.first())
                    .map(|r| r.id);
                prop_assert_eq!(Some(owners[hash].id), expected);
            }
        }
    }
}
