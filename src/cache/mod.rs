//! Read-through value cache for table lookups.
//!
//! Values read from the hashed files are kept for a bounded time (TTL) and
//! evicted least-recently-used first once the byte capacity is reached.

mod value_cache;

pub use value_cache::{CacheStats, ValueCache};
