use super::config::PersistenceUnit;
use super::unit_of_work::UnitOfWork;
use crate::core::{PersistError, Result};
use crate::storage::{Session, StorageEngine};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Unit-of-work pool
///
/// Sessions are opened lazily up to `max_units` and reused after release.
/// Closed, idle or expired sessions are discarded on the next acquisition.
pub struct UnitOfWorkPool {
    unit: PersistenceUnit,
    engine: Arc<dyn StorageEngine>,
    shared: Arc<PoolShared>,
}

/// State shared between the pool and the guards it hands out
pub(crate) struct PoolShared {
    available: Mutex<VecDeque<PooledSession>>,
    total_units: AtomicUsize,
    closed: AtomicBool,
}

/// A session parked in the pool
pub(crate) struct PooledSession {
    pub(crate) session: Box<dyn Session>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledSession {
    fn new(session: Box<dyn Session>) -> Self {
        let now = Instant::now();
        Self {
            session,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }

    fn refresh_last_used(&mut self) {
        self.last_used = Instant::now();
    }
}

impl PoolShared {
    fn discard(&self, session_id: u64, reason: &str) {
        self.total_units.fetch_sub(1, Ordering::SeqCst);
        debug!(session = session_id, reason, "unit of work discarded");
    }

    /// Return a released session. Closed pools and broken sessions drop it.
    pub(crate) async fn give_back(&self, mut pooled: PooledSession, healthy: bool) {
        let id = pooled.session.id();
        if self.closed.load(Ordering::SeqCst) || !healthy || !pooled.session.is_open() {
            if let Err(err) = pooled.session.close().await {
                warn!(session = id, error = %err, "failed to close unit of work");
            }
            self.discard(id, "not reusable");
            return;
        }

        pooled.refresh_last_used();
        self.available.lock().await.push_back(pooled);
    }

    /// Synchronous variant for `Drop`; gives up when the lock is busy.
    pub(crate) fn try_give_back(&self, mut pooled: PooledSession) {
        let id = pooled.session.id();
        if pooled.session.is_transaction_active() {
            warn!(
                session = id,
                "unit of work dropped with an active transaction; discarding it, use release().await"
            );
            self.discard(id, "active transaction on drop");
            return;
        }

        if self.closed.load(Ordering::SeqCst) || !pooled.session.is_open() {
            self.discard(id, "not reusable");
            return;
        }

        match self.available.try_lock() {
            Ok(mut available) => {
                pooled.refresh_last_used();
                available.push_back(pooled);
            }
            Err(_) => {
                warn!(session = id, "pool lock busy on drop; discarding unit of work");
                self.discard(id, "pool lock busy");
            }
        }
    }
}

impl UnitOfWorkPool {
    /// Create the pool and open the initial units of work
    pub async fn new(unit: PersistenceUnit, engine: Arc<dyn StorageEngine>) -> Result<Self> {
        unit.validate()?;

        let pool = Self {
            unit,
            engine,
            shared: Arc::new(PoolShared {
                available: Mutex::new(VecDeque::new()),
                total_units: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };

        pool.ensure_min_units().await?;

        Ok(pool)
    }

    /// Get a unit of work from the pool, waiting up to `acquire_timeout`
    pub async fn acquire(&self) -> Result<UnitOfWork> {
        let start = Instant::now();

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(PersistError::Configuration(format!(
                    "Persistence unit '{}' is closed",
                    self.unit.name
                )));
            }

            if let Some(mut pooled) = self.try_get_available().await? {
                pooled.refresh_last_used();
                match pooled.session.reset().await {
                    Ok(()) => return Ok(self.guard(pooled)),
                    Err(err) => {
                        warn!(session = pooled.session.id(), error = %err, "pooled unit of work failed to reset");
                        self.shared.give_back(pooled, false).await;
                        continue;
                    }
                }
            }

            if let Some(pooled) = self.try_create_session().await? {
                return Ok(self.guard(pooled));
            }

            if start.elapsed() > self.unit.acquire_timeout {
                return Err(PersistError::PoolExhausted(format!(
                    "no unit of work available within {:?} (max {})",
                    self.unit.acquire_timeout, self.unit.max_units
                )));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn guard(&self, pooled: PooledSession) -> UnitOfWork {
        UnitOfWork::new(pooled, Arc::clone(&self.shared), self.unit.operation_timeout)
    }

    async fn try_get_available(&self) -> Result<Option<PooledSession>> {
        let mut available = self.shared.available.lock().await;

        let mut kept = VecDeque::with_capacity(available.len());
        while let Some(mut pooled) = available.pop_front() {
            if pooled.is_expired(self.unit.max_lifetime)
                || pooled.is_idle_too_long(self.unit.idle_timeout)
                || !pooled.session.is_open()
            {
                let id = pooled.session.id();
                if let Err(err) = pooled.session.close().await {
                    warn!(session = id, error = %err, "failed to close expired unit of work");
                }
                self.shared.discard(id, "expired");
            } else {
                kept.push_back(pooled);
            }
        }
        *available = kept;

        Ok(available.pop_front())
    }

    /// Open a new session if under the limit
    async fn try_create_session(&self) -> Result<Option<PooledSession>> {
        let reserved = self
            .shared
            .total_units
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.unit.max_units).then_some(total + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        match self.engine.open_session().await {
            Ok(session) => {
                debug!(session = session.id(), unit = %self.unit.name, "unit of work created");
                Ok(Some(PooledSession::new(session)))
            }
            Err(err) => {
                self.shared.total_units.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Ensure the minimum number of units of work, at least one
    async fn ensure_min_units(&self) -> Result<()> {
        let target = self.unit.min_units.max(1);
        while self.shared.total_units.load(Ordering::SeqCst) < target {
            match self.try_create_session().await? {
                Some(pooled) => self.shared.available.lock().await.push_back(pooled),
                None => break,
            }
        }
        Ok(())
    }

    /// Close every idle unit of work; units in use are closed on release
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut available = self.shared.available.lock().await;
        while let Some(mut pooled) = available.pop_front() {
            let id = pooled.session.id();
            if let Err(err) = pooled.session.close().await {
                warn!(session = id, error = %err, "failed to close unit of work");
            }
            self.shared.discard(id, "pool closed");
        }
        Ok(())
    }

    /// Mark the pool closed without waiting; used from `Drop`
    pub(crate) fn close_now(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut available) = self.shared.available.try_lock() {
            let drained = available.len();
            available.clear();
            self.shared.total_units.fetch_sub(drained, Ordering::SeqCst);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.shared.available.lock().await;
        let total = self.shared.total_units.load(Ordering::SeqCst);

        PoolStats {
            total_units: total,
            available_units: available.len(),
            active_units: total.saturating_sub(available.len()),
            max_units: self.unit.max_units,
        }
    }
}

/// Unit-of-work pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_units: usize,
    pub available_units: usize,
    pub active_units: usize,
    pub max_units: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_units, self.total_units, self.available_units, self.max_units
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryEngine;

    fn pool_unit() -> PersistenceUnit {
        PersistenceUnit::new("pool-test")
    }

    async fn pool(unit: PersistenceUnit) -> UnitOfWorkPool {
        let engine: Arc<dyn StorageEngine> = Arc::new(InMemoryEngine::new(unit.clone()));
        UnitOfWorkPool::new(unit, engine).await.unwrap()
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = pool(pool_unit().min_units(2).max_units(5)).await;
        let stats = pool.stats().await;

        assert_eq!(stats.total_units, 2);
        assert_eq!(stats.available_units, 2);
    }

    #[tokio::test]
    async fn test_release_returns_to_pool() {
        let pool = pool(pool_unit().min_units(1).max_units(5)).await;

        let uow = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.active_units, 1);
        assert_eq!(stats.available_units, 0);

        uow.release().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.available_units, 1);
        assert_eq!(stats.total_units, 1);
    }

    #[tokio::test]
    async fn test_max_units_limit() {
        let pool = pool(
            pool_unit()
                .max_units(2)
                .acquire_timeout(Duration::from_millis(100)),
        )
        .await;

        let _first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();

        let result = pool.acquire().await;
        assert!(matches!(result, Err(PersistError::PoolExhausted(_))));
    }

    #[tokio::test]
    async fn test_drop_with_active_transaction_discards_unit() {
        let pool = pool(pool_unit().max_units(2)).await;

        {
            let mut uow = pool.acquire().await.unwrap();
            uow.begin().await.unwrap();
        }

        let stats = pool.stats().await;
        assert_eq!(stats.total_units, 0);
        assert_eq!(stats.available_units, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_acquire() {
        let pool = pool(pool_unit()).await;
        pool.close().await.unwrap();
        assert!(pool.is_closed());
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().await.total_units, 0);
    }
}
