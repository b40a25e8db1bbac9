//! Versioned response partitions and the read strategies built on them.
//!
//! - Partitions are named `{prefix}-{purpose}-{version}`
//! - Entries are keyed by normalized request (method + URL) and replaced whole
//! - Cache-first for static assets, network-first for API calls and navigations

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheKey, CacheResult, CacheSource, PartitionName, Purpose};
