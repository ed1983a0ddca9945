mod batch;
mod bulk;
mod entries;
mod feeds;
mod matching;
mod schema;
mod types;

pub use batch::BatchBuilder;
pub use feeds::next_check_after;
pub use matching::{classify, drop_repeated_hashes, select_owners, Classified};
pub use schema::Database;
pub use types::{
    DatabaseError, Enclosure, Entry, EntryExtra, EntryStatus, Feed, FeedRefreshed, Job, NewFeed,
    StoredEntry,
};
