pub mod cluster;

pub use cluster::{AtomicLong, ClusterRuntime, GridAtomicLong, InMemoryClusterNode, InMemoryGrid};

use crate::core::{Persistable, PersistError, Result};
use crate::dao::Dao;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_COUNTER_SUFFIX: &str = "IDSupplier";

/// Source of unique, strictly increasing identifiers
#[async_trait]
pub trait IdSupplier: Send + Sync {
    async fn next_id(&self) -> Result<i64>;
}

/// Identifier supplier backed by a cluster-wide atomic counter.
///
/// The counter is named `<entity><suffix>` and seeded with the largest
/// identifier already stored, so the first id handed out on an empty store
/// is 1 and on a store holding `M` it is `M + 1`. When another member
/// created the counter first, its value is kept and the seed is ignored.
pub struct DistributedIdSupplier<T: Persistable> {
    counter: Arc<dyn AtomicLong>,
    counter_name: String,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Persistable> DistributedIdSupplier<T> {
    pub async fn new<D: Dao<T>>(cluster: &dyn ClusterRuntime, dao: &D) -> Result<Self> {
        Self::with_suffix(cluster, dao, DEFAULT_COUNTER_SUFFIX).await
    }

    pub async fn with_suffix<D: Dao<T>>(
        cluster: &dyn ClusterRuntime,
        dao: &D,
        suffix: &str,
    ) -> Result<Self> {
        if suffix.trim().is_empty() {
            return Err(PersistError::Validation(
                "Counter suffix cannot be blank".to_string(),
            ));
        }

        let counter_name = format!("{}{}", T::meta().name, suffix);
        let seed = dao.max_id_as_long().await?;

        let attachment = |reason: String| PersistError::CounterAttachment {
            name: counter_name.clone(),
            reason,
        };
        let counter = cluster
            .atomic_long(&counter_name, seed, true)
            .await
            .map_err(|err| attachment(err.to_string()))?
            .ok_or_else(|| attachment("counter was neither found nor created".to_string()))?;
        let current = counter.get().await.map_err(|err| attachment(err.to_string()))?;

        info!(
            counter = %counter_name,
            node = cluster.node_id(),
            seed,
            current,
            "id supplier attached"
        );

        Ok(Self {
            counter,
            counter_name,
            _entity: PhantomData,
        })
    }

    /// Next identifier, strictly greater than every one issued before
    pub async fn next(&self) -> Result<i64> {
        self.counter.increment_and_get().await
    }

    /// Last identifier issued, or the seed when none was
    pub async fn current(&self) -> Result<i64> {
        self.counter.get().await
    }

    pub fn counter_name(&self) -> &str {
        &self.counter_name
    }

    /// Detach from the counter. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.counter.close()
    }
}

#[async_trait]
impl<T: Persistable> IdSupplier for DistributedIdSupplier<T> {
    async fn next_id(&self) -> Result<i64> {
        self.next().await
    }
}

impl<T: Persistable> Drop for DistributedIdSupplier<T> {
    fn drop(&mut self) {
        if self.counter.is_closed() {
            return;
        }
        if let Err(err) = self.counter.close() {
            warn!(counter = %self.counter_name, error = %err, "failed to detach counter");
        }
    }
}
