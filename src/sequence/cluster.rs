use crate::core::{PersistError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A cluster member able to hand out named, cluster-wide atomic counters.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    fn node_id(&self) -> &str;

    fn is_active(&self) -> bool;

    /// Attach to the counter `name`. When absent it is created with
    /// `initial` if `create` is set, otherwise `None` is returned.
    /// An existing counter keeps its value; `initial` is ignored.
    async fn atomic_long(
        &self,
        name: &str,
        initial: i64,
        create: bool,
    ) -> Result<Option<Arc<dyn AtomicLong>>>;

    /// Leave the cluster; every counter handle of this node is closed.
    async fn leave(&self) -> Result<()>;
}

/// Handle to a cluster-wide 64-bit counter
#[async_trait]
pub trait AtomicLong: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self) -> Result<i64>;

    async fn increment_and_get(&self) -> Result<i64>;

    /// Counters only move forward: `delta` must be at least 1.
    async fn add_and_get(&self, delta: i64) -> Result<i64>;

    /// Set `new` if the value is still `expected`. `new` must exceed
    /// `expected`; a lower value is refused with an error.
    async fn compare_and_set(&self, expected: i64, new: i64) -> Result<bool>;

    /// Detach this handle. The counter is destroyed with its last handle.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// The shared value behind every handle of one counter
struct GridCounter {
    value: AtomicI64,
    attached: AtomicUsize,
}

#[derive(Default)]
struct GridShared {
    counters: Mutex<HashMap<String, Arc<GridCounter>>>,
    members: Mutex<HashSet<String>>,
}

/// An in-process data grid. Nodes joined to the same grid share counters,
/// which lets tests simulate several cluster members in one process.
#[derive(Clone, Default)]
pub struct InMemoryGrid {
    shared: Arc<GridShared>,
}

impl InMemoryGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the grid as `node_id`
    pub fn join(&self, node_id: impl Into<String>) -> Result<Arc<InMemoryClusterNode>> {
        let node_id = node_id.into();
        if node_id.trim().is_empty() {
            return Err(PersistError::Cluster("node_id must not be empty".to_string()));
        }

        let mut members = self.shared.members.lock()?;
        if !members.insert(node_id.clone()) {
            return Err(PersistError::Cluster(format!(
                "Node '{}' is already a member of the grid",
                node_id
            )));
        }
        info!(node = %node_id, members = members.len(), "node joined grid");

        Ok(Arc::new(InMemoryClusterNode {
            node_id,
            grid: Arc::clone(&self.shared),
            active: Arc::new(AtomicBool::new(true)),
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn members(&self) -> Result<Vec<String>> {
        let mut members: Vec<String> = self.shared.members.lock()?.iter().cloned().collect();
        members.sort();
        Ok(members)
    }

    /// Whether a counter currently exists in the grid
    pub fn has_counter(&self, name: &str) -> Result<bool> {
        Ok(self.shared.counters.lock()?.contains_key(name))
    }
}

/// Cluster member of an [`InMemoryGrid`]
pub struct InMemoryClusterNode {
    node_id: String,
    grid: Arc<GridShared>,
    active: Arc<AtomicBool>,
    handles: Mutex<Vec<Arc<GridAtomicLong>>>,
}

impl InMemoryClusterNode {
    fn leave_now(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let handles = std::mem::take(&mut *self.handles.lock()?);
        for handle in handles {
            handle.close()?;
        }
        self.grid.members.lock()?.remove(&self.node_id);
        info!(node = %self.node_id, "node left grid");
        Ok(())
    }
}

#[async_trait]
impl ClusterRuntime for InMemoryClusterNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn atomic_long(
        &self,
        name: &str,
        initial: i64,
        create: bool,
    ) -> Result<Option<Arc<dyn AtomicLong>>> {
        if !self.is_active() {
            return Err(PersistError::Cluster(format!(
                "Node '{}' has left the grid",
                self.node_id
            )));
        }
        if name.trim().is_empty() {
            return Err(PersistError::Cluster("counter name must not be empty".to_string()));
        }

        let counter = {
            let mut counters = self.grid.counters.lock()?;
            match counters.get(name) {
                Some(existing) => {
                    existing.attached.fetch_add(1, Ordering::SeqCst);
                    Arc::clone(existing)
                }
                None if create => {
                    let counter = Arc::new(GridCounter {
                        value: AtomicI64::new(initial),
                        attached: AtomicUsize::new(1),
                    });
                    counters.insert(name.to_string(), Arc::clone(&counter));
                    debug!(node = %self.node_id, counter = name, initial, "counter created");
                    counter
                }
                None => return Ok(None),
            }
        };

        let handle = Arc::new(GridAtomicLong {
            name: name.to_string(),
            counter,
            grid: Arc::clone(&self.grid),
            node_active: Arc::clone(&self.active),
            closed: AtomicBool::new(false),
        });
        let mut handles = self.handles.lock()?;
        handles.retain(|h| !h.is_closed());
        handles.push(Arc::clone(&handle));
        Ok(Some(handle))
    }

    async fn leave(&self) -> Result<()> {
        self.leave_now()
    }
}

impl Drop for InMemoryClusterNode {
    fn drop(&mut self) {
        if let Err(err) = self.leave_now() {
            warn!(node = %self.node_id, error = %err, "failed to leave grid on drop");
        }
    }
}

/// Counter handle issued by an [`InMemoryClusterNode`]
pub struct GridAtomicLong {
    name: String,
    counter: Arc<GridCounter>,
    grid: Arc<GridShared>,
    node_active: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl GridAtomicLong {
    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PersistError::Cluster(format!(
                "Counter '{}' has been closed",
                self.name
            )));
        }
        if !self.node_active.load(Ordering::SeqCst) {
            return Err(PersistError::Cluster(format!(
                "Counter '{}' is unreachable: node has left the grid",
                self.name
            )));
        }
        Ok(())
    }

    /// Lock-free add; overflow is reported instead of wrapping
    fn add(&self, delta: i64) -> Result<i64> {
        self.ensure_usable()?;
        let previous = self
            .counter
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(delta)
            })
            .map_err(|current| {
                PersistError::Cluster(format!(
                    "Counter '{}' would overflow: {} + {}",
                    self.name, current, delta
                ))
            })?;
        Ok(previous + delta)
    }
}

#[async_trait]
impl AtomicLong for GridAtomicLong {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<i64> {
        self.ensure_usable()?;
        Ok(self.counter.value.load(Ordering::SeqCst))
    }

    async fn increment_and_get(&self) -> Result<i64> {
        self.add(1)
    }

    async fn add_and_get(&self, delta: i64) -> Result<i64> {
        if delta < 1 {
            return Err(PersistError::Cluster(format!(
                "Counter '{}' cannot move backwards: delta {}",
                self.name, delta
            )));
        }
        self.add(delta)
    }

    async fn compare_and_set(&self, expected: i64, new: i64) -> Result<bool> {
        self.ensure_usable()?;
        if new <= expected {
            return Err(PersistError::Cluster(format!(
                "Counter '{}' cannot move backwards: {} -> {}",
                self.name, expected, new
            )));
        }
        Ok(self
            .counter
            .value
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut counters = self.grid.counters.lock()?;
        if self.counter.attached.fetch_sub(1, Ordering::SeqCst) == 1 {
            let same = counters
                .get(&self.name)
                .is_some_and(|c| Arc::ptr_eq(c, &self.counter));
            if same {
                counters.remove(&self.name);
                debug!(counter = %self.name, "counter destroyed with its last handle");
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_creator_wins_seed() {
        let grid = InMemoryGrid::new();
        let a = grid.join("a").unwrap();
        let b = grid.join("b").unwrap();

        let first = a.atomic_long("PostIDSupplier", 10, true).await.unwrap().unwrap();
        let second = b.atomic_long("PostIDSupplier", 99, true).await.unwrap().unwrap();

        assert_eq!(first.increment_and_get().await.unwrap(), 11);
        assert_eq!(second.increment_and_get().await.unwrap(), 12);
        assert_eq!(first.get().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_attach_without_create() {
        let grid = InMemoryGrid::new();
        let node = grid.join("a").unwrap();
        assert!(node.atomic_long("missing", 0, false).await.unwrap().is_none());
        assert!(!grid.has_counter("missing").unwrap());
    }

    #[tokio::test]
    async fn test_last_close_destroys_counter() {
        let grid = InMemoryGrid::new();
        let node = grid.join("a").unwrap();
        let first = node.atomic_long("c", 5, true).await.unwrap().unwrap();
        let second = node.atomic_long("c", 0, true).await.unwrap().unwrap();

        first.close().unwrap();
        assert!(grid.has_counter("c").unwrap());
        assert!(first.get().await.is_err());

        second.close().unwrap();
        assert!(!grid.has_counter("c").unwrap());

        let fresh = node.atomic_long("c", 0, true).await.unwrap().unwrap();
        assert_eq!(fresh.get().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_reported() {
        let grid = InMemoryGrid::new();
        let node = grid.join("a").unwrap();
        let counter = node.atomic_long("edge", i64::MAX - 1, true).await.unwrap().unwrap();

        assert_eq!(counter.increment_and_get().await.unwrap(), i64::MAX);
        assert!(counter.increment_and_get().await.is_err());
        assert_eq!(counter.get().await.unwrap(), i64::MAX);
    }

    #[tokio::test]
    async fn test_counter_never_moves_backwards() {
        let grid = InMemoryGrid::new();
        let node = grid.join("a").unwrap();
        let first = node.atomic_long("PostIDSupplier", 0, true).await.unwrap().unwrap();
        let second = node.atomic_long("PostIDSupplier", 0, true).await.unwrap().unwrap();
        for _ in 0..3 {
            first.increment_and_get().await.unwrap();
        }

        assert!(second.compare_and_set(3, 0).await.is_err());
        assert!(second.compare_and_set(3, 3).await.is_err());
        assert!(second.add_and_get(0).await.is_err());
        assert!(second.add_and_get(-2).await.is_err());
        assert_eq!(first.get().await.unwrap(), 3);

        assert!(!second.compare_and_set(2, 10).await.unwrap());
        assert!(second.compare_and_set(3, 10).await.unwrap());
        assert_eq!(second.add_and_get(5).await.unwrap(), 15);
        assert_eq!(first.increment_and_get().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_closed_handles_are_pruned_on_attach() {
        let grid = InMemoryGrid::new();
        let node = grid.join("a").unwrap();
        for _ in 0..5 {
            let counter = node.atomic_long("c", 0, true).await.unwrap().unwrap();
            counter.close().unwrap();
        }
        let _live = node.atomic_long("c", 0, true).await.unwrap().unwrap();
        assert_eq!(node.handles.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_closes_handles() {
        let grid = InMemoryGrid::new();
        let node = grid.join("a").unwrap();
        let counter = node.atomic_long("c", 0, true).await.unwrap().unwrap();

        node.leave().await.unwrap();
        assert!(!node.is_active());
        assert!(counter.is_closed());
        assert!(node.atomic_long("c", 0, true).await.is_err());
        assert!(grid.members().unwrap().is_empty());
        assert!(grid.join("").is_err());
    }
}
