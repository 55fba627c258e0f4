use crate::context::PersistenceUnit;
use crate::core::{EntityMeta, Result, Row, Value};
use crate::expression::{BoundQuery, QueryHints, QueryRange};
use async_trait::async_trait;
use std::sync::Arc;

/// Creates storage engines from a persistence unit descriptor.
pub trait StorageProvider: Send + Sync {
    fn create_engine(&self, unit: &PersistenceUnit) -> Result<Arc<dyn StorageEngine>>;
}

/// Storage engine trait - the process-wide factory of sessions
#[async_trait]
pub trait StorageEngine: Send + Sync {
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Open a new session (one unit of work)
    async fn open_session(&self) -> Result<Box<dyn Session>>;

    /// Close the engine; sessions opened from it stop working
    fn close(&self) -> Result<()>;

    fn stats(&self) -> EngineStats;
}

/// Scalar aggregations over the rows selected by a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Max(String),
}

/// One unit of work against the store.
///
/// Writes require an active transaction and are buffered until `flush`
/// (or `commit`, which flushes first). Reads observe the session's own
/// flushed writes plus everything committed by others.
#[async_trait]
pub trait Session: Send {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    fn is_transaction_active(&self) -> bool;

    /// Begin a transaction; a no-op when one is already active
    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Make a new entity persistent. When `key` is `None` the store assigns
    /// an identity, which is returned and written into the stored row.
    async fn persist(&mut self, meta: &EntityMeta, key: Option<Value>, row: Row) -> Result<Value>;

    /// Copy the state of a detached entity onto the managed one, inserting
    /// it when absent. Returns the managed row.
    async fn merge(&mut self, meta: &EntityMeta, key: Value, row: Row) -> Result<Row>;

    async fn remove(&mut self, meta: &EntityMeta, key: Value) -> Result<()>;

    async fn find(&mut self, meta: &EntityMeta, key: &Value) -> Result<Option<Row>>;

    async fn select(
        &mut self,
        meta: &EntityMeta,
        query: &BoundQuery,
        range: QueryRange,
        hints: QueryHints,
    ) -> Result<Vec<Row>>;

    async fn aggregate(
        &mut self,
        meta: &EntityMeta,
        aggregate: Aggregate,
        query: &BoundQuery,
        hints: QueryHints,
    ) -> Result<Value>;

    /// Synchronize pending changes with the store inside the transaction
    async fn flush(&mut self) -> Result<()>;

    /// Detach every managed entity; unflushed changes are dropped
    async fn clear(&mut self) -> Result<()>;

    /// Roll back any active transaction and detach everything before reuse
    async fn reset(&mut self) -> Result<()>;

    fn contains(&self, meta: &EntityMeta, key: &Value) -> bool;

    async fn close(&mut self) -> Result<()>;
}

/// Engine-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub sessions_opened: u64,
    pub transactions_begun: u64,
    pub commits: u64,
    pub rollbacks: u64,
    /// Explicit flushes only; the implicit flush before commit is not counted
    pub flushes: u64,
    pub clears: u64,
    pub query_cache_hits: u64,
    pub query_cache_misses: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Engine Stats: {} sessions, {} begun, {} committed, {} rolled back, {} flushes, {} clears, cache {}/{} hit/miss",
            self.sessions_opened,
            self.transactions_begun,
            self.commits,
            self.rollbacks,
            self.flushes,
            self.clears,
            self.query_cache_hits,
            self.query_cache_misses
        )
    }
}
