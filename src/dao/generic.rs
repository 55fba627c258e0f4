use super::Dao;
use crate::context::{PersistenceContext, UnitOfWork};
use crate::core::{EntityId, Persistable, PersistError, Result, Row, Value};
use crate::expression::{BoundQuery, Query, QueryHints, QueryRange};
use crate::storage::Aggregate;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{Instrument, debug, info_span, warn};

/// [`Dao`] implementation over a [`PersistenceContext`].
///
/// Entity-specific DAOs wrap a `GenericDao` and add their own finders on top
/// of [`GenericDao::find_by_query`].
pub struct GenericDao<T: Persistable> {
    context: Arc<PersistenceContext>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Persistable> Clone for GenericDao<T> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            _entity: PhantomData,
        }
    }
}

impl<T: Persistable> GenericDao<T> {
    pub fn new(context: Arc<PersistenceContext>) -> Self {
        Self {
            context,
            _entity: PhantomData,
        }
    }

    pub fn context(&self) -> &Arc<PersistenceContext> {
        &self.context
    }

    /// Save inside the caller's transaction; no demarcation, no release.
    pub async fn save_or_update_in(&self, uow: &mut UnitOfWork, entity: T) -> Result<T> {
        Self::write(uow, entity).await
    }

    async fn write(uow: &mut UnitOfWork, entity: T) -> Result<T> {
        let meta = T::meta();

        if entity.is_new() {
            let key = entity.id().map(|id| id.to_value());
            let row = to_row(&entity)?;
            let key = uow.persist(&meta, key, row.clone()).await?;
            // hand back the stored form, like the merge branch does
            let mut saved: T = from_row(row)?;
            if saved.id().is_none() {
                saved.set_id(T::Id::from_value(&key)?);
            }
            return Ok(saved);
        }

        let id = entity.id().ok_or_else(|| {
            PersistError::Validation(format!(
                "{} is not new but carries no identifier",
                meta.name
            ))
        })?;
        let merged = uow.merge(&meta, id.to_value(), to_row(&entity)?).await?;
        from_row(merged)
    }

    /// Release the unit of work, keeping the first error
    async fn finish<R>(uow: UnitOfWork, outcome: Result<R>) -> Result<R> {
        let released = uow.release().await;
        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(error = %release_err, "failed to release unit of work after error");
                Err(err)
            }
        }
    }

    async fn count_bound(&self, cacheable: bool, query: BoundQuery) -> Result<u64> {
        let meta = T::meta();
        let mut uow = self.context.unit_of_work().await?;
        let outcome = uow
            .aggregate(&meta, Aggregate::Count, &query, QueryHints::cacheable(cacheable))
            .await;
        let count = Self::finish(uow, outcome).await?;

        count
            .as_i64()
            .and_then(|c| u64::try_from(c).ok())
            .ok_or_else(|| PersistError::TypeMismatch(format!("count returned {}", count)))
    }

    async fn select_bound(
        &self,
        cacheable: bool,
        range: QueryRange,
        query: BoundQuery,
    ) -> Result<Vec<T>> {
        let meta = T::meta();
        let mut uow = self.context.unit_of_work().await?;
        let outcome = uow
            .select(&meta, &query, range, QueryHints::cacheable(cacheable))
            .await;
        let rows = Self::finish(uow, outcome).await?;
        debug!(entity = meta.name, rows = rows.len(), "query returned");

        rows.into_iter().map(from_row).collect()
    }

    async fn max_value(&self, attribute: &str) -> Result<Value> {
        let meta = T::meta();
        if attribute.trim().is_empty() {
            return Err(PersistError::Validation(format!(
                "Attribute name for max on {} cannot be blank",
                meta.name
            )));
        }

        let mut uow = self.context.unit_of_work().await?;
        let outcome = uow
            .aggregate(
                &meta,
                Aggregate::Max(attribute.to_string()),
                &BoundQuery::all(),
                QueryHints::default(),
            )
            .await;
        Self::finish(uow, outcome).await
    }
}

fn to_row<T: Persistable>(entity: &T) -> Result<Row> {
    Ok(serde_json::to_value(entity)?)
}

fn from_row<T: Persistable>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(row)?)
}

#[async_trait]
impl<T: Persistable> Dao<T> for GenericDao<T> {
    async fn save_or_update(&self, entity: T) -> Result<T> {
        let span = info_span!("dao.save_or_update", entity = T::meta().name, new = entity.is_new());
        self.context
            .with_transaction(move |uow| Box::pin(async move { Self::write(uow, entity).await }))
            .instrument(span)
            .await
    }

    async fn save_or_update_in_batch(&self, entities: Vec<T>, batch_size: usize) -> Result<Vec<T>> {
        let meta = T::meta();
        if batch_size == 0 {
            return Err(PersistError::Validation(format!(
                "Batch size for {} must be at least 1",
                meta.name
            )));
        }

        let span = info_span!(
            "dao.save_or_update_in_batch",
            entity = meta.name,
            count = entities.len(),
            batch_size
        );
        self.context
            .with_transaction(move |uow| {
                Box::pin(async move {
                    let mut saved = Vec::with_capacity(entities.len());
                    for (index, entity) in entities.into_iter().enumerate() {
                        if index > 0 && index % batch_size == 0 {
                            uow.flush().await?;
                            uow.clear().await?;
                            debug!(processed = index, "batch window flushed and cleared");
                        }
                        saved.push(Self::write(uow, entity).await?);
                    }
                    Ok(saved)
                })
            })
            .instrument(span)
            .await
    }

    async fn find_by_id(&self, id: &T::Id) -> Result<Option<T>> {
        let meta = T::meta();
        let mut uow = self.context.unit_of_work().await?;
        let outcome = uow.find(&meta, &id.to_value()).await;
        let row = Self::finish(uow, outcome).await?;
        row.map(from_row).transpose()
    }

    async fn delete(&self, entity: &T) -> Result<()> {
        self.delete_by_id(entity.id()).await
    }

    async fn delete_by_id(&self, id: Option<T::Id>) -> Result<()> {
        let meta = T::meta();
        let id = id.ok_or_else(|| {
            PersistError::Validation(format!("Cannot delete {}: identifier is null", meta.name))
        })?;

        let span = info_span!("dao.delete", entity = meta.name, id = %id);
        let key = id.to_value();
        self.context
            .with_transaction(move |uow| {
                Box::pin(async move {
                    let meta = T::meta();
                    uow.remove(&meta, key).await
                })
            })
            .instrument(span)
            .await
    }

    async fn count_all(&self, cacheable: bool) -> Result<u64> {
        self.count_bound(cacheable, BoundQuery::all()).await
    }

    async fn count_by_query(&self, cacheable: bool, query: &Query, params: &[Value]) -> Result<u64> {
        let bound = query.bind_positional(params)?;
        self.count_bound(cacheable, bound).await
    }

    async fn count_by_query_and_named_params(
        &self,
        cacheable: bool,
        query: &Query,
        params: &HashMap<String, Value>,
    ) -> Result<u64> {
        let bound = query.bind_named(params)?;
        self.count_bound(cacheable, bound).await
    }

    async fn max<R>(&self, attribute: &str) -> Result<Option<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let value = self.max_value(attribute).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value.to_json())?))
    }

    async fn max_by_id_attribute(&self, attribute: &str) -> Result<Option<T::Id>> {
        let value = self.max_value(attribute).await?;
        if value.is_null() {
            return Ok(None);
        }
        T::Id::from_value(&value).map(Some)
    }

    async fn max_id_as_long_attribute(&self, attribute: &str) -> Result<i64> {
        let value = self.max_value(attribute).await?;
        match &value {
            Value::Null => Ok(0),
            Value::Integer(i) => Ok(*i),
            Value::Text(s) => s.parse().map_err(|_| {
                PersistError::TypeMismatch(format!(
                    "max of '{}' is '{}', not an integer identifier",
                    attribute, s
                ))
            }),
            other => other.as_i64().ok_or_else(|| {
                PersistError::TypeMismatch(format!(
                    "max of '{}' is {}, not an integer identifier",
                    attribute,
                    other.type_name()
                ))
            }),
        }
    }

    async fn find_all(&self, cacheable: bool, range: QueryRange) -> Result<Vec<T>> {
        self.select_bound(cacheable, range, BoundQuery::all()).await
    }

    async fn find_by_query(
        &self,
        cacheable: bool,
        range: QueryRange,
        query: &Query,
        params: &[Value],
    ) -> Result<Vec<T>> {
        let bound = query.bind_positional(params)?;
        self.select_bound(cacheable, range, bound).await
    }

    async fn find_by_query_and_named_params(
        &self,
        cacheable: bool,
        range: QueryRange,
        query: &Query,
        params: &HashMap<String, Value>,
    ) -> Result<Vec<T>> {
        let bound = query.bind_named(params)?;
        self.select_bound(cacheable, range, bound).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PersistenceUnit;
    use crate::core::EntityMeta;
    use crate::storage::InMemoryProvider;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Option<i64>,
        body: String,
    }

    impl Persistable for Note {
        type Id = i64;

        fn meta() -> EntityMeta {
            EntityMeta::new("Note")
        }

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }
    }

    async fn dao() -> GenericDao<Note> {
        let context = Arc::new(PersistenceContext::new());
        context
            .initialize(PersistenceUnit::new("notes"), &InMemoryProvider)
            .await
            .unwrap();
        GenericDao::new(context)
    }

    fn note(body: &str) -> Note {
        Note {
            id: None,
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_new_entity_gets_store_identity() {
        let dao = dao().await;
        let saved = dao.save_or_update(note("first")).await.unwrap();
        assert_eq!(saved.id, Some(1));

        let found = dao.find_by_id(&1).await.unwrap();
        assert_eq!(found, Some(saved));
    }

    #[tokio::test]
    async fn test_blank_max_attribute_is_rejected() {
        let dao = dao().await;
        let err = dao.max::<i64>("  ").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(dao.max::<String>("body").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_in_callers_transaction() {
        let dao = dao().await;
        let mut uow = dao.context().unit_of_work().await.unwrap();
        uow.begin().await.unwrap();
        dao.save_or_update_in(&mut uow, note("a")).await.unwrap();
        dao.save_or_update_in(&mut uow, note("b")).await.unwrap();
        uow.rollback().await.unwrap();
        uow.release().await.unwrap();

        assert_eq!(dao.count_all(false).await.unwrap(), 0);
    }
}
