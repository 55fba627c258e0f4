// ============================================================================
// persistkit Library
// ============================================================================
//
// Generic data access over pluggable storage engines, pooled units of work
// with scoped transactions, and cluster-wide monotonic identifier supply.
//
// ============================================================================

pub mod context;
pub mod core;
pub mod dao;
pub mod expression;
pub mod prelude;
pub mod sequence;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{EntityId, EntityMeta, ErrorKind, PersistError, Persistable, Result, Row, Value};

pub use context::{PersistenceContext, PersistenceUnit, PoolStats, UnitOfWork};
pub use dao::{Dao, GenericDao};
pub use expression::{Predicate, Query, QueryHints, QueryRange};
pub use sequence::{
    AtomicLong, ClusterRuntime, DistributedIdSupplier, IdSupplier, InMemoryClusterNode,
    InMemoryGrid,
};
pub use storage::{EngineStats, InMemoryEngine, InMemoryProvider, StorageEngine, StorageProvider};
