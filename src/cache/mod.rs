//! Bucketed response cache for offline support.
//!
//! This module provides the storage and execution half of the offline cache router:
//! - Named buckets, each bounded by entry count (FIFO eviction) and entry age
//! - The four runtime strategies plus the precached app shell
//! - Basic offline mode (serve cached responses when the network is unavailable)

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, Outcome};
pub use storage::{BucketSummary, CacheStorage, EntryInfo, NoopStorage, SqliteStorage};
pub use traits::{CachedResponse, Limits, Policy, Strategy};

#[cfg(test)]
pub use traits::CacheSource;
