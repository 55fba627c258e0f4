use super::pool::{PoolShared, PooledSession};
use crate::core::{EntityMeta, PersistError, Result, Row, Value};
use crate::expression::{BoundQuery, QueryHints, QueryRange};
use crate::storage::{Aggregate, Session};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// RAII guard over one pooled session
///
/// Exclusively owned by its holder. `release().await` rolls back anything
/// left open, detaches all entities and returns the session to the pool.
/// Dropping the guard instead returns it only when no transaction is active;
/// otherwise the session is discarded so uncommitted writes never leak.
pub struct UnitOfWork {
    id: u64,
    pooled: Option<PooledSession>,
    pool: Arc<PoolShared>,
    operation_timeout: Option<Duration>,
}

impl UnitOfWork {
    pub(crate) fn new(
        pooled: PooledSession,
        pool: Arc<PoolShared>,
        operation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: pooled.session.id(),
            pooled: Some(pooled),
            pool,
            operation_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Direct access to the underlying session
    pub fn session(&mut self) -> Result<&mut dyn Session> {
        match self.pooled.as_mut() {
            Some(pooled) => Ok(pooled.session.as_mut()),
            None => Err(PersistError::SessionClosed(self.id)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.pooled.as_ref().is_some_and(|p| p.session.is_open())
    }

    pub fn is_transaction_active(&self) -> bool {
        self.pooled
            .as_ref()
            .is_some_and(|p| p.session.is_transaction_active())
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.session()?.begin().await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.session()?.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.session()?.rollback().await
    }

    pub async fn persist(&mut self, meta: &EntityMeta, key: Option<Value>, row: Row) -> Result<Value> {
        self.session()?.persist(meta, key, row).await
    }

    pub async fn merge(&mut self, meta: &EntityMeta, key: Value, row: Row) -> Result<Row> {
        self.session()?.merge(meta, key, row).await
    }

    pub async fn remove(&mut self, meta: &EntityMeta, key: Value) -> Result<()> {
        self.session()?.remove(meta, key).await
    }

    pub async fn find(&mut self, meta: &EntityMeta, key: &Value) -> Result<Option<Row>> {
        self.session()?.find(meta, key).await
    }

    pub async fn select(
        &mut self,
        meta: &EntityMeta,
        query: &BoundQuery,
        range: QueryRange,
        hints: QueryHints,
    ) -> Result<Vec<Row>> {
        self.session()?.select(meta, query, range, hints).await
    }

    pub async fn aggregate(
        &mut self,
        meta: &EntityMeta,
        aggregate: Aggregate,
        query: &BoundQuery,
        hints: QueryHints,
    ) -> Result<Value> {
        self.session()?.aggregate(meta, aggregate, query, hints).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.session()?.flush().await
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.session()?.clear().await
    }

    pub fn contains(&self, meta: &EntityMeta, key: &Value) -> bool {
        self.pooled
            .as_ref()
            .is_some_and(|p| p.session.contains(meta, key))
    }

    /// Run `work` inside a transaction on this unit of work.
    ///
    /// Commits when `work` succeeds. Any failure, including a commit failure
    /// or the operation timeout, rolls back and returns the original error.
    pub async fn in_transaction<R, F>(&mut self, work: F) -> Result<R>
    where
        R: Send,
        F: for<'u> FnOnce(&'u mut UnitOfWork) -> BoxFuture<'u, Result<R>> + Send,
    {
        self.begin().await?;

        let outcome = match self.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, work(self)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PersistError::Timeout(format!(
                    "transaction on unit of work {} exceeded {:?}",
                    self.id, limit
                ))),
            },
            None => work(self).await,
        };

        let outcome = match outcome {
            Ok(value) => self.commit().await.map(|()| value),
            Err(err) => Err(err),
        };

        if outcome.is_err() && self.is_transaction_active() {
            if let Err(rollback_err) = self.rollback().await {
                error!(
                    unit_of_work = self.id,
                    error = %rollback_err,
                    "rollback failed after transaction error"
                );
            }
        }
        outcome
    }

    /// Roll back, detach everything and hand the session back to the pool.
    pub async fn release(mut self) -> Result<()> {
        if let Some(mut pooled) = self.pooled.take() {
            let reset = pooled.session.reset().await;
            self.pool.give_back(pooled, reset.is_ok()).await;
            reset?;
        }
        Ok(())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.pool.try_give_back(pooled);
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("transaction_active", &self.is_transaction_active())
            .finish()
    }
}
