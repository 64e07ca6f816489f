//! The `persistence` module holds the append log behind queue topics.
//!
//! Entries survive restarts when the store is opened on a path. Pending-entry
//! bookkeeping lives with the consumer groups in the access point, not here.

pub mod sled_store;

pub use sled_store::{EntryId, LogStore, StoredEntry};
