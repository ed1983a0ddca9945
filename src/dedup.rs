//! Cross-feed deduplication of unread entries.
//!
//! When the same content reaches a user through two subscriptions, only the
//! first feed to create it counts it as unread. Later creations in other feeds
//! are still stored, but as read.
//!
//! The registry lives for the process and is never persisted. It is rebuilt as
//! refreshes happen, and the reconciler seeds it from stored rows of other
//! feeds, so a restart loses little.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::storage::{Entry, EntryStatus};

/// Result of filtering one batch of creation candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// Unread candidates left unread
    pub fresh: usize,
    /// Candidates flipped to read
    pub deduplicated: usize,
}

/// Seam between the reconciler and the dedup state.
pub trait DedupFilter: Send + Sync {
    /// Flip unread candidates whose hash is owned by another feed to read and
    /// register the hashes not seen before. Read and removed candidates are
    /// left untouched.
    fn filter(&self, user_id: i64, entries: &mut [Entry]) -> DedupOutcome;

    /// Register `feed_id` as the owner of `hash` unless the hash is already known.
    fn remember(&self, user_id: i64, hash: &str, feed_id: i64);

    /// Drop the registration of `hash` if `feed_id` owns it. Used to undo a
    /// refresh whose entries were never committed.
    fn forget(&self, user_id: i64, hash: &str, feed_id: i64);
}

/// One user's hash → owning feed map.
struct UserHashes {
    owners: LruCache<String, i64>,
}

impl UserHashes {
    fn new(capacity: Option<NonZeroUsize>) -> Self {
        let owners = match capacity {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self { owners }
    }
}

/// Process-wide dedup registry.
///
/// The outer lock is only held to find or create a user's map; each user's map
/// has its own lock, so refreshes of different users never contend.
pub struct DedupRegistry {
    users: Mutex<HashMap<i64, Arc<Mutex<UserHashes>>>>,
    capacity: Option<NonZeroUsize>,
    deduplicated: AtomicUsize,
}

impl Default for DedupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupRegistry {
    /// Registry remembering every hash for the life of the process.
    pub fn new() -> Self {
        Self::with_capacity_per_user(0)
    }

    /// Registry keeping at most `capacity` hashes per user, least recently
    /// seen evicted first. 0 means unbounded.
    pub fn with_capacity_per_user(capacity: usize) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            capacity: NonZeroUsize::new(capacity),
            deduplicated: AtomicUsize::new(0),
        }
    }

    fn user(&self, user_id: i64) -> Arc<Mutex<UserHashes>> {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            users
                .entry(user_id)
                .or_insert_with(|| Arc::new(Mutex::new(UserHashes::new(self.capacity)))),
        )
    }

    /// Number of users with a map.
    pub fn users(&self) -> usize {
        self.users.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of hashes remembered for `user_id`.
    pub fn len(&self, user_id: i64) -> usize {
        let user = {
            let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            match users.get(&user_id) {
                Some(user) => Arc::clone(user),
                None => return 0,
            }
        };
        let hashes = user.lock().unwrap_or_else(PoisonError::into_inner);
        hashes.owners.len()
    }

    /// Feed currently owning `hash` for `user_id`, without touching recency.
    pub fn owner(&self, user_id: i64, hash: &str) -> Option<i64> {
        let user = {
            let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(users.get(&user_id)?)
        };
        let hashes = user.lock().unwrap_or_else(PoisonError::into_inner);
        hashes.owners.peek(hash).copied()
    }

    /// Deduplications since the registry was built.
    pub fn total_deduplicated(&self) -> usize {
        self.deduplicated.load(Ordering::Relaxed)
    }
}

impl DedupFilter for DedupRegistry {
    fn filter(&self, user_id: i64, entries: &mut [Entry]) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();
        if entries.is_empty() {
            return outcome;
        }

        let user = self.user(user_id);
        let mut hashes = user.lock().unwrap_or_else(PoisonError::into_inner);

        for entry in entries
            .iter_mut()
            .filter(|e| e.status == EntryStatus::Unread)
        {
            match hashes.owners.get(&entry.hash).copied() {
                None => {
                    hashes.owners.put(entry.hash.clone(), entry.feed_id);
                    outcome.fresh += 1;
                }
                Some(owner) if owner != entry.feed_id => {
                    entry.status = EntryStatus::Read;
                    outcome.deduplicated += 1;
                }
                Some(_) => outcome.fresh += 1,
            }
        }

        if outcome.deduplicated > 0 {
            self.deduplicated
                .fetch_add(outcome.deduplicated, Ordering::Relaxed);
        }
        outcome
    }

    fn remember(&self, user_id: i64, hash: &str, feed_id: i64) {
        let user = self.user(user_id);
        let mut hashes = user.lock().unwrap_or_else(PoisonError::into_inner);
        if !hashes.owners.contains(hash) {
            hashes.owners.put(hash.to_string(), feed_id);
        }
    }

    fn forget(&self, user_id: i64, hash: &str, feed_id: i64) {
        let user = {
            let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            match users.get(&user_id) {
                Some(user) => Arc::clone(user),
                None => return,
            }
        };
        let mut hashes = user.lock().unwrap_or_else(PoisonError::into_inner);
        if hashes.owners.peek(hash) == Some(&feed_id) {
            hashes.owners.pop(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn candidate(feed_id: i64, hash: &str) -> Entry {
        Entry {
            user_id: 1,
            feed_id,
            hash: hash.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_feed_keeps_unread_second_is_flipped() {
        let registry = DedupRegistry::new();

        let mut a = vec![candidate(1, "h")];
        assert_eq!(
            registry.filter(1, &mut a),
            DedupOutcome { fresh: 1, deduplicated: 0 }
        );
        assert_eq!(a[0].status, EntryStatus::Unread);

        let mut b = vec![candidate(2, "h")];
        assert_eq!(
            registry.filter(1, &mut b),
            DedupOutcome { fresh: 0, deduplicated: 1 }
        );
        assert_eq!(b[0].status, EntryStatus::Read);
        assert_eq!(registry.owner(1, "h"), Some(1));
        assert_eq!(registry.total_deduplicated(), 1);
    }

    #[test]
    fn test_same_feed_repeat_stays_unread() {
        let registry = DedupRegistry::new();
        let mut batch = vec![candidate(1, "h"), candidate(1, "h")];
        let outcome = registry.filter(1, &mut batch);
        assert_eq!(outcome, DedupOutcome { fresh: 2, deduplicated: 0 });
        assert!(batch.iter().all(|e| e.status == EntryStatus::Unread));
    }

    #[test]
    fn test_users_are_isolated() {
        let registry = DedupRegistry::new();
        registry.filter(1, &mut [candidate(1, "h")]);

        let mut other_user = vec![candidate(2, "h")];
        let outcome = registry.filter(2, &mut other_user);
        assert_eq!(outcome.deduplicated, 0);
        assert_eq!(other_user[0].status, EntryStatus::Unread);
        assert_eq!(registry.users(), 2);
        assert_eq!(registry.len(1), 1);
        assert_eq!(registry.len(3), 0);
    }

    #[test]
    fn test_read_and_removed_candidates_bypass() {
        let registry = DedupRegistry::new();
        let mut batch = vec![candidate(1, "a"), candidate(1, "b")];
        batch[0].status = EntryStatus::Read;
        batch[1].status = EntryStatus::Removed;

        let outcome = registry.filter(1, &mut batch);
        assert_eq!(outcome, DedupOutcome::default());
        assert_eq!(registry.len(1), 0);
        assert_eq!(batch[1].status, EntryStatus::Removed);
    }

    #[test]
    fn test_remember_only_registers_unseen_hashes() {
        let registry = DedupRegistry::new();
        registry.remember(1, "h", 5);
        registry.remember(1, "h", 6);
        assert_eq!(registry.owner(1, "h"), Some(5));

        let mut batch = vec![candidate(6, "h")];
        registry.filter(1, &mut batch);
        assert_eq!(batch[0].status, EntryStatus::Read);
    }

    #[test]
    fn test_forget_only_drops_own_registration() {
        let registry = DedupRegistry::new();
        registry.filter(1, &mut [candidate(1, "a"), candidate(1, "b")]);

        registry.forget(1, "a", 2);
        assert_eq!(registry.owner(1, "a"), Some(1));

        registry.forget(1, "a", 1);
        assert_eq!(registry.owner(1, "a"), None);
        assert_eq!(registry.len(1), 1);

        // Unknown users and hashes are a no-op
        registry.forget(7, "a", 1);
        registry.forget(1, "missing", 1);
        assert_eq!(registry.users(), 1);

        let mut later = vec![candidate(2, "a")];
        registry.filter(1, &mut later);
        assert_eq!(later[0].status, EntryStatus::Unread);
    }

    #[test]
    fn test_capacity_evicts_least_recently_seen() {
        let registry = DedupRegistry::with_capacity_per_user(2);
        registry.filter(1, &mut [candidate(1, "a"), candidate(1, "b")]);
        // Touch "a" so "b" is the eviction victim
        registry.filter(1, &mut [candidate(1, "a")]);
        registry.filter(1, &mut [candidate(1, "c")]);

        assert_eq!(registry.len(1), 2);
        assert_eq!(registry.owner(1, "a"), Some(1));
        assert_eq!(registry.owner(1, "b"), None);

        let mut again = vec![candidate(2, "b")];
        registry.filter(1, &mut again);
        assert_eq!(again[0].status, EntryStatus::Unread);
    }

    #[test]
    fn test_concurrent_feeds_of_one_user_count_once() {
        let registry = DedupRegistry::new();

        let fresh: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (1..=8)
                .map(|feed_id| {
                    let registry = &registry;
                    s.spawn(move || {
                        let mut batch = vec![candidate(feed_id, "shared")];
                        registry.filter(1, &mut batch).fresh
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(fresh, 1);
        assert_eq!(registry.total_deduplicated(), 7);
    }

    proptest! {
        #[test]
        fn prop_unread_entries_belong_to_first_owner(
            ops in prop::collection::vec((1i64..3, 1i64..4, 0usize..6), 1..60)
        ) {
            let registry = DedupRegistry::new();
            let mut first_owner: HashMap<(i64, String), i64> = HashMap::new();

            for (user_id, feed_id, h) in ops {
                let hash = format!("h{h}");
                let owner = *first_owner.entry((user_id, hash.clone())).or_insert(feed_id);

                let mut batch = vec![candidate(feed_id, &hash)];
                registry.filter(user_id, &mut batch);

                let expected = if owner == feed_id { EntryStatus::Unread } else { EntryStatus::Read };
                prop_assert_eq!(batch[0].status, expected);
            }
        }
    }
}
