//! Normalizing response cache: storage plus the provider-wrapping layer.

mod layer;
mod store;

pub use layer::{CacheOutcome, CachingProvider};
pub use store::{CacheEntry, CacheStats, CacheStore, InMemoryBackend, SqliteBackend, StoreBackend};
