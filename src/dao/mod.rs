pub mod generic;

pub use generic::GenericDao;

use crate::core::{Persistable, Result, Value};
use crate::expression::{Query, QueryRange};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// Data access operations shared by every entity type.
///
/// Writes run in their own transaction on a unit of work acquired for the
/// call and released before returning; failed writes are rolled back and
/// the original error is returned. Reads run without a transaction.
#[async_trait]
pub trait Dao<T: Persistable>: Send + Sync {
    /// Insert a new entity or merge a persisted one, decided by `is_new()`.
    async fn save_or_update(&self, entity: T) -> Result<T>;

    async fn update(&self, entity: T) -> Result<T> {
        self.save_or_update(entity).await
    }

    /// Save all entities in one transaction, flushing and clearing the unit
    /// of work every `batch_size` entities.
    async fn save_or_update_in_batch(&self, entities: Vec<T>, batch_size: usize) -> Result<Vec<T>>;

    async fn update_in_batch(&self, entities: Vec<T>, batch_size: usize) -> Result<Vec<T>> {
        self.save_or_update_in_batch(entities, batch_size).await
    }

    async fn find_by_id(&self, id: &T::Id) -> Result<Option<T>>;

    async fn delete(&self, entity: &T) -> Result<()>;

    /// Remove by identifier. A missing identifier is rejected before any
    /// unit of work is touched.
    async fn delete_by_id(&self, id: Option<T::Id>) -> Result<()>;

    async fn count_all(&self, cacheable: bool) -> Result<u64>;

    /// `params[0]` binds `?1`
    async fn count_by_query(&self, cacheable: bool, query: &Query, params: &[Value]) -> Result<u64>;

    async fn count_by_query_and_named_params(
        &self,
        cacheable: bool,
        query: &Query,
        params: &HashMap<String, Value>,
    ) -> Result<u64>;

    /// Maximum of `attribute`, `None` when the store is empty.
    async fn max<R>(&self, attribute: &str) -> Result<Option<R>>
    where
        R: DeserializeOwned + Send + 'static;

    async fn max_by_id(&self) -> Result<Option<T::Id>> {
        self.max_by_id_attribute(T::meta().id_attribute).await
    }

    async fn max_by_id_attribute(&self, attribute: &str) -> Result<Option<T::Id>>;

    /// Largest identifier as an integer, 0 for an empty store.
    async fn max_id_as_long(&self) -> Result<i64> {
        self.max_id_as_long_attribute(T::meta().id_attribute).await
    }

    async fn max_id_as_long_attribute(&self, attribute: &str) -> Result<i64>;

    async fn find_all(&self, cacheable: bool, range: QueryRange) -> Result<Vec<T>>;

    async fn find_by_query(
        &self,
        cacheable: bool,
        range: QueryRange,
        query: &Query,
        params: &[Value],
    ) -> Result<Vec<T>>;

    async fn find_by_query_and_named_params(
        &self,
        cacheable: bool,
        range: QueryRange,
        query: &Query,
        params: &HashMap<String, Value>,
    ) -> Result<Vec<T>>;
}
