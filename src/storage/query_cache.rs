use crate::core::{Result, Row, Value};
use crate::expression::QueryRange;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity: String,
    pub fingerprint: String,
    pub range: QueryRange,
}

#[derive(Debug, Clone)]
pub enum CachedResult {
    Rows(Vec<Row>),
    Scalar(Value),
}

struct Entry {
    /// Table version the result was computed against
    version: u64,
    result: CachedResult,
}

/// LRU cache of committed query results.
///
/// Entries are tagged with the table version they were read at; a commit
/// bumps the version, so stale entries are dropped on lookup.
pub struct QueryCache {
    entries: Mutex<LruCache<CacheKey, Entry>>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &CacheKey, version: u64) -> Result<Option<CachedResult>> {
        let mut entries = self.entries.lock()?;
        let fresh = match entries.peek(key) {
            Some(entry) => entry.version == version,
            None => return Ok(None),
        };
        if !fresh {
            entries.pop(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.result.clone()))
    }

    pub fn put(&self, key: CacheKey, version: u64, result: CachedResult) -> Result<()> {
        self.entries.lock()?.put(key, Entry { version, result });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
