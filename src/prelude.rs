//! Recommended imports grouped by abstraction level.
//!
//! `dx` covers application code: entities, DAOs, queries and id supply.
//! `advanced` exposes the storage and cluster seams for custom backends.

pub mod dx {
    //! Stable surface for application code.
    pub use crate::context::{PersistenceContext, PersistenceUnit};
    pub use crate::core::{EntityMeta, PersistError, Persistable, Result, Value};
    pub use crate::dao::{Dao, GenericDao};
    pub use crate::expression::{
        Predicate, Query, QueryRange, contains_pattern, literal, named, param,
    };
    pub use crate::sequence::{DistributedIdSupplier, IdSupplier, InMemoryGrid};
    pub use crate::storage::InMemoryProvider;
}

pub mod advanced {
    //! Seams for plugging in other storage engines or cluster runtimes.
    pub use crate::context::{UnitOfWork, UnitOfWorkPool};
    pub use crate::core::{EntityId, Row};
    pub use crate::expression::{BoundQuery, QueryHints};
    pub use crate::sequence::{AtomicLong, ClusterRuntime};
    pub use crate::storage::{Aggregate, EngineStats, Session, StorageEngine, StorageProvider};
}
