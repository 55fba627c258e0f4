pub mod config;
pub mod pool;
pub mod unit_of_work;

pub use config::PersistenceUnit;
pub use pool::{PoolStats, UnitOfWorkPool};
pub use unit_of_work::UnitOfWork;

use crate::core::{PersistError, Result};
use crate::storage::{StorageEngine, StorageProvider};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

struct ContextState {
    unit: PersistenceUnit,
    engine: Arc<dyn StorageEngine>,
    pool: Arc<UnitOfWorkPool>,
}

/// Persistence context provider
///
/// Owns the storage engine of one persistence unit and hands out units of
/// work. Construct once, share through `Arc`, initialize exactly once.
///
/// ```ignore
/// let context = Arc::new(PersistenceContext::new());
/// context.initialize(PersistenceUnit::new("blog"), &InMemoryProvider).await?;
///
/// let id = context
///     .with_transaction(|uow| Box::pin(async move { uow.persist(&meta, None, row).await }))
///     .await?;
/// ```
pub struct PersistenceContext {
    initialized: AtomicBool,
    closed: AtomicBool,
    state: RwLock<Option<ContextState>>,
}

impl Default for PersistenceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: RwLock::new(None),
        }
    }

    /// Create the storage engine and warm the pool.
    ///
    /// Only the first caller initializes; every later call returns
    /// `Ok(false)` and leaves the existing engine untouched.
    pub async fn initialize(
        &self,
        unit: PersistenceUnit,
        provider: &dyn StorageProvider,
    ) -> Result<bool> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        match Self::build_state(unit, provider).await {
            Ok(state) => {
                info!(
                    unit = %state.unit.name,
                    engine = state.engine.name(),
                    min_units = state.unit.min_units,
                    max_units = state.unit.max_units,
                    "persistence context initialized"
                );
                *self.state.write()? = Some(state);
                Ok(true)
            }
            Err(err) => {
                // let a later call retry
                self.initialized.store(false, Ordering::SeqCst);
                error!(error = %err, "persistence context initialization failed");
                Err(err)
            }
        }
    }

    /// Initialize from a named unit and a flat property map.
    pub async fn initialize_named(
        &self,
        name: &str,
        properties: &HashMap<String, String>,
        provider: &dyn StorageProvider,
    ) -> Result<bool> {
        let unit = PersistenceUnit::from_properties(name, properties)?;
        self.initialize(unit, provider).await
    }

    async fn build_state(
        unit: PersistenceUnit,
        provider: &dyn StorageProvider,
    ) -> Result<ContextState> {
        unit.validate()?;
        let engine = provider.create_engine(&unit)?;
        let pool = UnitOfWorkPool::new(unit.clone(), Arc::clone(&engine)).await?;
        Ok(ContextState {
            unit,
            engine,
            pool: Arc::new(pool),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The storage engine factory of this context
    pub fn factory(&self) -> Result<Arc<dyn StorageEngine>> {
        let state = self.state.read()?;
        let state = state.as_ref().ok_or_else(not_initialized)?;
        if self.is_closed() || !state.engine.is_open() {
            return Err(PersistError::Configuration(format!(
                "Storage engine of persistence unit '{}' is closed",
                state.unit.name
            )));
        }
        Ok(Arc::clone(&state.engine))
    }

    pub fn unit(&self) -> Result<PersistenceUnit> {
        let state = self.state.read()?;
        state
            .as_ref()
            .map(|s| s.unit.clone())
            .ok_or_else(not_initialized)
    }

    fn pool(&self) -> Result<Arc<UnitOfWorkPool>> {
        self.factory()?;
        let state = self.state.read()?;
        state
            .as_ref()
            .map(|s| Arc::clone(&s.pool))
            .ok_or_else(not_initialized)
    }

    /// Acquire a unit of work; give it back with `release().await`
    pub async fn unit_of_work(&self) -> Result<UnitOfWork> {
        let pool = self.pool()?;
        pool.acquire().await
    }

    pub async fn pool_stats(&self) -> Result<PoolStats> {
        let pool = self.pool()?;
        Ok(pool.stats().await)
    }

    /// Run `work` in a transaction on a freshly acquired unit of work.
    ///
    /// Commits on `Ok`, rolls back on `Err`, and always releases the unit
    /// of work. A release failure after an error is logged, not returned.
    pub async fn with_transaction<R, F>(&self, work: F) -> Result<R>
    where
        R: Send,
        F: for<'u> FnOnce(&'u mut UnitOfWork) -> BoxFuture<'u, Result<R>> + Send,
    {
        let mut uow = self.unit_of_work().await?;
        let outcome = uow.in_transaction(work).await;
        let released = uow.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(error = %release_err, "failed to release unit of work after error");
                Err(err)
            }
        }
    }

    /// Close every pooled unit of work and the engine. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let parts = {
            let state = self.state.read()?;
            state
                .as_ref()
                .map(|s| (Arc::clone(&s.pool), Arc::clone(&s.engine), s.unit.name.clone()))
        };

        if let Some((pool, engine, name)) = parts {
            pool.close().await?;
            engine.close()?;
            info!(unit = %name, "persistence context closed");
        }
        Ok(())
    }
}

fn not_initialized() -> PersistError {
    PersistError::Configuration("Persistence context is not initialized".into())
}

impl Drop for PersistenceContext {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(state) = self.state.get_mut() else {
            return;
        };
        if let Some(state) = state.as_ref() {
            state.pool.close_now();
            if let Err(err) = state.engine.close() {
                warn!(error = %err, "failed to close storage engine on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryProvider;

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let context = PersistenceContext::new();
        assert!(
            context
                .initialize(PersistenceUnit::new("first"), &InMemoryProvider)
                .await
                .unwrap()
        );
        assert!(
            !context
                .initialize(PersistenceUnit::new("second"), &InMemoryProvider)
                .await
                .unwrap()
        );
        assert_eq!(context.unit().unwrap().name, "first");
    }

    #[tokio::test]
    async fn test_factory_requires_initialization() {
        let context = PersistenceContext::new();
        let err = context.factory().err().unwrap();
        assert!(err.is_configuration());
        assert!(context.unit_of_work().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_initialization_can_be_retried() {
        let context = PersistenceContext::new();
        let invalid = PersistenceUnit::new("broken").max_units(0);
        assert!(context.initialize(invalid, &InMemoryProvider).await.is_err());
        assert!(!context.is_initialized());
        assert!(
            context
                .initialize(PersistenceUnit::new("fixed"), &InMemoryProvider)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let context = PersistenceContext::new();
        context
            .initialize(PersistenceUnit::new("closing"), &InMemoryProvider)
            .await
            .unwrap();
        context.close().await.unwrap();
        context.close().await.unwrap();
        assert!(context.factory().is_err());
        assert!(context.unit_of_work().await.is_err());
    }
}
