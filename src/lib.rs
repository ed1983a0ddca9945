//! Feed synchronization core.
//!
//! - [`storage`]: SQLite persistence, the scheduler's batch queries and the
//!   entry reconciler
//! - [`dedup`]: cross-feed deduplication of unread entries
//! - [`worker`]: reference worker pool driving scheduled refreshes
//! - [`feed`]: the parsed-entry input contract
//! - [`config`]: TOML configuration

pub mod config;
pub mod dedup;
pub mod feed;
pub mod storage;
pub mod worker;
