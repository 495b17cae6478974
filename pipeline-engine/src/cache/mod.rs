// Build cache
// Persisted per-job cache locations with exclusive writer leases

pub mod manager;
pub mod store;

pub use manager::{CacheLease, CacheManager};
pub use store::{CacheError, CacheKey, CacheStore, FsCacheStore};
