//! Input contract from the fetching and parsing layer.
//!
//! Fetching and format parsing happen upstream; what reaches the core is an
//! ordered list of [`ParsedEntry`] per feed.

mod entry;

pub use entry::ParsedEntry;
