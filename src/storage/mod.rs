pub mod engine;
pub mod memory;
pub mod query_cache;

pub use engine::{Aggregate, EngineStats, Session, StorageEngine, StorageProvider};
pub use memory::{InMemoryEngine, InMemoryProvider, InMemorySession};
pub use query_cache::QueryCache;
