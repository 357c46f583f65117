mod manager;

pub use manager::{cache_key, CacheEntry, CacheManager};
