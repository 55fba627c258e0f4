use super::engine::{Aggregate, EngineStats, Session, StorageEngine, StorageProvider};
use super::query_cache::{CacheKey, CachedResult, QueryCache};
use crate::context::PersistenceUnit;
use crate::core::{EntityMeta, PersistError, Result, Row, Value};
use crate::expression::query::attribute_value;
use crate::expression::{BoundQuery, QueryHints, QueryRange};
use crate::transaction::{Change, Transaction, TransactionId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Committed rows of one entity, ordered by key
#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<Value, Row>,
    /// Bumped by every commit that touches the table
    version: u64,
    /// Highest integer key ever stored or handed out
    last_identity: i64,
}

#[derive(Default)]
struct Counters {
    sessions_opened: AtomicU64,
    transactions_begun: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    flushes: AtomicU64,
    clears: AtomicU64,
    query_cache_hits: AtomicU64,
    query_cache_misses: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            transactions_begun: self.transactions_begun.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            query_cache_hits: self.query_cache_hits.load(Ordering::Relaxed),
            query_cache_misses: self.query_cache_misses.load(Ordering::Relaxed),
        }
    }
}

struct EngineShared {
    unit: PersistenceUnit,
    /// Tables with a shared lock; commits apply atomically under the write lock
    tables: RwLock<HashMap<String, Table>>,
    open: AtomicBool,
    counters: Counters,
    cache: Option<QueryCache>,
    next_session_id: AtomicU64,
}

impl EngineShared {
    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(PersistError::Configuration(format!(
                "Storage engine '{}' is closed",
                self.unit.name
            )));
        }
        Ok(())
    }
}

/// Reference storage engine keeping every entity in process memory.
pub struct InMemoryEngine {
    shared: Arc<EngineShared>,
}

impl InMemoryEngine {
    pub fn new(unit: PersistenceUnit) -> Self {
        let cache = unit
            .query_cache
            .then(|| QueryCache::new(unit.query_cache_capacity));
        Self {
            shared: Arc::new(EngineShared {
                unit,
                tables: RwLock::new(HashMap::new()),
                open: AtomicBool::new(true),
                counters: Counters::default(),
                cache,
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Committed row count of an entity, bypassing sessions
    pub async fn row_count(&self, entity: &str) -> usize {
        let tables = self.shared.tables.read().await;
        tables.get(entity).map(|t| t.rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StorageEngine for InMemoryEngine {
    fn name(&self) -> &str {
        &self.shared.unit.name
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn open_session(&self) -> Result<Box<dyn Session>> {
        self.shared.ensure_open()?;
        let id = self.shared.next_session_id.fetch_add(1, Ordering::SeqCst);
        Counters::bump(&self.shared.counters.sessions_opened);
        debug!(session = id, engine = %self.shared.unit.name, "session opened");

        Ok(Box::new(InMemorySession {
            id,
            shared: Arc::clone(&self.shared),
            open: true,
            transaction: None,
            workspace: HashMap::new(),
            metas: HashMap::new(),
            managed: HashMap::new(),
        }))
    }

    fn close(&self) -> Result<()> {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            debug!(engine = %self.shared.unit.name, "storage engine closed");
        }
        Ok(())
    }

    fn stats(&self) -> EngineStats {
        self.shared.counters.snapshot()
    }
}

/// Provider for [`InMemoryEngine`]
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryProvider;

impl StorageProvider for InMemoryProvider {
    fn create_engine(&self, unit: &PersistenceUnit) -> Result<Arc<dyn StorageEngine>> {
        unit.validate()?;
        Ok(Arc::new(InMemoryEngine::new(unit.clone())))
    }
}

/// A flushed but uncommitted write
#[derive(Debug, Clone)]
enum Staged {
    /// New key; commit fails if someone else stored it meanwhile
    Inserted(Row),
    Upserted(Row),
    /// Commit fails if the key vanished meanwhile
    Deleted,
}

type Workspace = BTreeMap<Value, Staged>;

pub struct InMemorySession {
    id: u64,
    shared: Arc<EngineShared>,
    open: bool,
    transaction: Option<Transaction>,
    /// Flushed writes of the active transaction, per entity
    workspace: HashMap<String, Workspace>,
    metas: HashMap<String, EntityMeta>,
    /// Identity map; `None` marks an entity removed in this session
    managed: HashMap<(String, Value), Option<Row>>,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<()> {
        if !self.open {
            return Err(PersistError::SessionClosed(self.id));
        }
        self.shared.ensure_open()
    }

    fn ensure_managed_entity(&mut self, meta: &EntityMeta) -> Result<()> {
        if !self.shared.unit.manages(meta.name) {
            return Err(PersistError::Configuration(format!(
                "Entity '{}' is not managed by persistence unit '{}'",
                meta.name, self.shared.unit.name
            )));
        }
        self.metas.entry(meta.name.to_string()).or_insert(*meta);
        Ok(())
    }

    fn active_transaction(&mut self) -> Result<&mut Transaction> {
        self.transaction.as_mut().ok_or_else(|| {
            PersistError::TransactionState("No transaction is in progress".into())
        })
    }

    fn ensure_writable(&mut self, meta: &EntityMeta) -> Result<()> {
        self.ensure_open()?;
        self.ensure_managed_entity(meta)?;
        self.active_transaction().map(|_| ())
    }

    fn record(&mut self, change: Change) -> Result<()> {
        let key = (change.entity_name().to_string(), change.key().clone());
        let row = change.row().cloned();
        self.active_transaction()?.record_change(change)?;
        self.managed.insert(key, row);
        Ok(())
    }

    async fn allocate_identity(&self, entity: &str) -> Result<Value> {
        let mut tables = self.shared.tables.write().await;
        let table = tables.entry(entity.to_string()).or_default();
        table.last_identity = table.last_identity.checked_add(1).ok_or_else(|| {
            PersistError::ConstraintViolation(format!("Identity of '{}' overflowed", entity))
        })?;
        Ok(Value::Integer(table.last_identity))
    }

    /// Apply pending changes to the workspace. All or nothing.
    async fn flush_pending(&mut self) -> Result<()> {
        let Some(transaction) = self.transaction.as_mut() else {
            return Ok(());
        };
        if transaction.pending_changes().is_empty() {
            return Ok(());
        }
        let pending = transaction.take_pending()?;

        match self.stage(pending).await {
            Ok(staged) => {
                self.workspace = staged;
                Ok(())
            }
            Err(err) => {
                // the drained changes are lost, so the transaction cannot commit
                if let Some(transaction) = self.transaction.as_mut() {
                    transaction.mark_rollback_only();
                    debug!(
                        session = self.id,
                        transaction = %transaction.id(),
                        error = %err,
                        "flush failed; transaction marked rollback-only"
                    );
                }
                Err(err)
            }
        }
    }

    /// Workspace with `pending` applied on top, or the first violation.
    async fn stage(&self, pending: Vec<Change>) -> Result<HashMap<String, Workspace>> {
        let tables = self.shared.tables.read().await;
        let mut staged = self.workspace.clone();

        for change in pending {
            let entity = change.entity_name().to_string();
            let committed = tables.get(&entity);
            let workspace = staged.entry(entity.clone()).or_default();

            match change {
                Change::Insert { key, row, .. } => {
                    if visible(committed, workspace, &key).is_some() {
                        return Err(PersistError::EntityExists {
                            entity,
                            id: key.to_string(),
                        });
                    }
                    let next = match workspace.get(&key) {
                        Some(Staged::Deleted) => Staged::Upserted(row),
                        _ => Staged::Inserted(row),
                    };
                    workspace.insert(key, next);
                }
                Change::Merge { key, row, .. } => {
                    let next = match workspace.get(&key) {
                        Some(Staged::Inserted(_)) => Staged::Inserted(row),
                        _ => Staged::Upserted(row),
                    };
                    workspace.insert(key, next);
                }
                Change::Delete { key, .. } => {
                    if visible(committed, workspace, &key).is_none() {
                        return Err(PersistError::EntityNotFound {
                            entity,
                            id: key.to_string(),
                        });
                    }
                    if matches!(workspace.get(&key), Some(Staged::Inserted(_))) {
                        workspace.remove(&key);
                    } else {
                        workspace.insert(key, Staged::Deleted);
                    }
                }
            }
        }

        for (entity, workspace) in &staged {
            if let Some(meta) = self.metas.get(entity) {
                check_unique(meta, tables.get(entity), workspace)?;
            }
        }
        Ok(staged)
    }

    fn discard_transaction(&mut self) {
        self.transaction = None;
        self.workspace.clear();
        // managed state may reflect discarded writes
        self.managed.clear();
    }

    fn rollback_inner(&mut self, reason: &str) -> Result<()> {
        let transaction = self.active_transaction()?;
        let id = transaction.id();
        transaction.rollback()?;
        self.discard_transaction();
        Counters::bump(&self.shared.counters.rollbacks);
        debug!(session = self.id, transaction = %id, reason, "transaction rolled back");
        Ok(())
    }

    /// Validate the workspace against committed state and publish it.
    async fn publish(&mut self) -> Result<()> {
        let mut tables = self.shared.tables.write().await;

        for (entity, workspace) in &self.workspace {
            let committed = tables.get(entity);
            for (key, staged) in workspace {
                let stored = committed.is_some_and(|t| t.rows.contains_key(key));
                match staged {
                    Staged::Inserted(_) if stored => {
                        return Err(PersistError::EntityExists {
                            entity: entity.clone(),
                            id: key.to_string(),
                        });
                    }
                    Staged::Deleted if !stored => {
                        return Err(PersistError::EntityNotFound {
                            entity: entity.clone(),
                            id: key.to_string(),
                        });
                    }
                    _ => {}
                }
            }
            if let Some(meta) = self.metas.get(entity) {
                check_unique(meta, committed, workspace)?;
            }
        }

        for (entity, workspace) in std::mem::take(&mut self.workspace) {
            if workspace.is_empty() {
                continue;
            }
            let table = tables.entry(entity).or_default();
            for (key, staged) in workspace {
                if let Value::Integer(id) = key {
                    table.last_identity = table.last_identity.max(id);
                }
                match staged {
                    Staged::Inserted(row) | Staged::Upserted(row) => {
                        table.rows.insert(key, row);
                    }
                    Staged::Deleted => {
                        table.rows.remove(&key);
                    }
                }
            }
            table.version += 1;
        }

        Ok(())
    }

    async fn visible_rows(&self, entity: &str) -> Vec<Row> {
        let tables = self.shared.tables.read().await;
        let mut view: BTreeMap<&Value, &Row> = tables
            .get(entity)
            .map(|t| t.rows.iter().collect())
            .unwrap_or_default();

        if let Some(workspace) = self.workspace.get(entity) {
            for (key, staged) in workspace {
                match staged {
                    Staged::Inserted(row) | Staged::Upserted(row) => {
                        view.insert(key, row);
                    }
                    Staged::Deleted => {
                        view.remove(key);
                    }
                }
            }
        }

        view.into_values().cloned().collect()
    }

    /// Make the session's own writes visible to a query
    async fn prepare_query(&mut self, meta: &EntityMeta) -> Result<()> {
        self.ensure_open()?;
        self.ensure_managed_entity(meta)?;
        if self.transaction.is_some() {
            self.flush_pending().await?;
        }
        Ok(())
    }

    /// Table version usable by the query cache, if any
    async fn cache_version(&self, entity: &str, hints: QueryHints) -> Option<u64> {
        self.shared.cache.as_ref()?;
        if !hints.cacheable || self.workspace.get(entity).is_some_and(|w| !w.is_empty()) {
            return None;
        }
        let tables = self.shared.tables.read().await;
        Some(tables.get(entity).map(|t| t.version).unwrap_or(0))
    }

    fn cache_lookup(&self, key: &CacheKey, version: Option<u64>) -> Result<Option<CachedResult>> {
        let (Some(cache), Some(version)) = (&self.shared.cache, version) else {
            return Ok(None);
        };
        let hit = cache.get(key, version)?;
        let counter = if hit.is_some() {
            &self.shared.counters.query_cache_hits
        } else {
            &self.shared.counters.query_cache_misses
        };
        Counters::bump(counter);
        Ok(hit)
    }

    fn cache_store(&self, key: CacheKey, version: Option<u64>, result: CachedResult) -> Result<()> {
        if let (Some(cache), Some(version)) = (&self.shared.cache, version) {
            cache.put(key, version, result)?;
        }
        Ok(())
    }

    async fn matching_rows(&self, meta: &EntityMeta, query: &BoundQuery) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for row in self.visible_rows(meta.name).await {
            if query.matches(&row)? {
                rows.push(row);
            }
        }
        query.sort(&mut rows);
        Ok(rows)
    }
}

fn visible<'a>(committed: Option<&'a Table>, workspace: &'a Workspace, key: &Value) -> Option<&'a Row> {
    match workspace.get(key) {
        Some(Staged::Inserted(row)) | Some(Staged::Upserted(row)) => Some(row),
        Some(Staged::Deleted) => None,
        None => committed.and_then(|t| t.rows.get(key)),
    }
}

fn check_unique(meta: &EntityMeta, committed: Option<&Table>, workspace: &Workspace) -> Result<()> {
    if meta.unique_attributes.is_empty() || workspace.is_empty() {
        return Ok(());
    }

    let mut view: BTreeMap<&Value, &Row> = committed
        .map(|t| t.rows.iter().collect())
        .unwrap_or_default();
    for (key, staged) in workspace {
        match staged {
            Staged::Inserted(row) | Staged::Upserted(row) => {
                view.insert(key, row);
            }
            Staged::Deleted => {
                view.remove(key);
            }
        }
    }

    for attribute in meta.unique_attributes {
        let mut seen: HashMap<Value, &Value> = HashMap::with_capacity(view.len());
        for (key, row) in &view {
            let value = attribute_value(row, attribute);
            if value.is_null() {
                continue;
            }
            if let Some(other) = seen.insert(value.clone(), key) {
                return Err(PersistError::ConstraintViolation(format!(
                    "Unique attribute {}.{} = '{}' is shared by ids {} and {}",
                    meta.name, attribute, value, other, key
                )));
            }
        }
    }
    Ok(())
}

fn stamp_key(meta: &EntityMeta, row: &mut Row, key: &Value) -> Result<()> {
    match row.as_object_mut() {
        Some(object) => {
            object.insert(meta.id_attribute.to_string(), key.to_json());
            Ok(())
        }
        None => Err(PersistError::TypeMismatch(format!(
            "Entity '{}' must serialize to an object",
            meta.name
        ))),
    }
}

#[async_trait]
impl Session for InMemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open && self.shared.open.load(Ordering::SeqCst)
    }

    fn is_transaction_active(&self) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|t| t.state().is_active())
    }

    async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.is_transaction_active() {
            return Ok(());
        }
        let transaction = Transaction::new(TransactionId::new());
        debug!(session = self.id, transaction = %transaction.id(), "transaction begun");
        self.transaction = Some(transaction);
        Counters::bump(&self.shared.counters.transactions_begun);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let transaction = self.active_transaction()?;
        if transaction.is_rollback_only() {
            let id = transaction.id();
            self.rollback_inner("rollback-only")?;
            return Err(PersistError::TransactionState(format!(
                "Transaction {} was marked rollback-only by a failed flush and has been rolled back",
                id
            )));
        }

        let outcome = match self.flush_pending().await {
            Ok(()) => self.publish().await,
            Err(err) => Err(err),
        };

        if let Err(err) = outcome {
            // a failed commit leaves nothing behind
            self.rollback_inner("commit failed")?;
            return Err(err);
        }

        let transaction = self.active_transaction()?;
        transaction.commit()?;
        let id = transaction.id();
        let changes = transaction.change_count();
        self.transaction = None;
        Counters::bump(&self.shared.counters.commits);
        debug!(session = self.id, transaction = %id, changes, "transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.rollback_inner("requested")
    }

    async fn persist(&mut self, meta: &EntityMeta, key: Option<Value>, mut row: Row) -> Result<Value> {
        self.ensure_writable(meta)?;

        let key = match key {
            Some(key) => {
                let managed_key = (meta.name.to_string(), key.clone());
                if matches!(self.managed.get(&managed_key), Some(Some(_))) {
                    return Err(PersistError::EntityExists {
                        entity: meta.name.to_string(),
                        id: key.to_string(),
                    });
                }
                key
            }
            None => self.allocate_identity(meta.name).await?,
        };
        stamp_key(meta, &mut row, &key)?;

        self.record(Change::Insert {
            entity: meta.name.to_string(),
            key: key.clone(),
            row,
        })?;
        Ok(key)
    }

    async fn merge(&mut self, meta: &EntityMeta, key: Value, mut row: Row) -> Result<Row> {
        self.ensure_writable(meta)?;
        stamp_key(meta, &mut row, &key)?;

        self.record(Change::Merge {
            entity: meta.name.to_string(),
            key,
            row: row.clone(),
        })?;
        Ok(row)
    }

    async fn remove(&mut self, meta: &EntityMeta, key: Value) -> Result<()> {
        self.ensure_writable(meta)?;
        self.record(Change::Delete {
            entity: meta.name.to_string(),
            key,
        })
    }

    async fn find(&mut self, meta: &EntityMeta, key: &Value) -> Result<Option<Row>> {
        self.ensure_open()?;
        self.ensure_managed_entity(meta)?;

        let managed_key = (meta.name.to_string(), key.clone());
        if let Some(state) = self.managed.get(&managed_key) {
            return Ok(state.clone());
        }

        let found = {
            let tables = self.shared.tables.read().await;
            match self.workspace.get(meta.name) {
                Some(workspace) => visible(tables.get(meta.name), workspace, key).cloned(),
                None => tables.get(meta.name).and_then(|t| t.rows.get(key)).cloned(),
            }
        };

        if let Some(row) = &found {
            self.managed.insert(managed_key, Some(row.clone()));
        }
        Ok(found)
    }

    async fn select(
        &mut self,
        meta: &EntityMeta,
        query: &BoundQuery,
        range: QueryRange,
        hints: QueryHints,
    ) -> Result<Vec<Row>> {
        self.prepare_query(meta).await?;

        let cache_key = CacheKey {
            entity: meta.name.to_string(),
            fingerprint: format!("select:{}", query.fingerprint()),
            range,
        };
        let version = self.cache_version(meta.name, hints).await;
        if let Some(CachedResult::Rows(rows)) = self.cache_lookup(&cache_key, version)? {
            return Ok(rows);
        }

        let rows = range.apply(self.matching_rows(meta, query).await?);
        self.cache_store(cache_key, version, CachedResult::Rows(rows.clone()))?;
        Ok(rows)
    }

    async fn aggregate(
        &mut self,
        meta: &EntityMeta,
        aggregate: Aggregate,
        query: &BoundQuery,
        hints: QueryHints,
    ) -> Result<Value> {
        self.prepare_query(meta).await?;

        let cache_key = CacheKey {
            entity: meta.name.to_string(),
            fingerprint: format!("{:?}:{}", aggregate, query.fingerprint()),
            range: QueryRange::all(),
        };
        let version = self.cache_version(meta.name, hints).await;
        if let Some(CachedResult::Scalar(value)) = self.cache_lookup(&cache_key, version)? {
            return Ok(value);
        }

        let rows = self.matching_rows(meta, query).await?;
        let value = match &aggregate {
            Aggregate::Count => Value::Integer(i64::try_from(rows.len()).unwrap_or(i64::MAX)),
            Aggregate::Max(attribute) => rows
                .iter()
                .map(|row| attribute_value(row, attribute))
                .filter(|value| !value.is_null())
                .max()
                .unwrap_or(Value::Null),
        };

        self.cache_store(cache_key, version, CachedResult::Scalar(value.clone()))?;
        Ok(value)
    }

    async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.active_transaction()?;
        self.flush_pending().await?;
        Counters::bump(&self.shared.counters.flushes);
        debug!(session = self.id, "session flushed");
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(transaction) = self.transaction.as_mut() {
            let dropped = transaction.discard_pending();
            if dropped > 0 {
                warn!(session = self.id, dropped, "clear discarded unflushed changes");
            }
        }
        self.managed.clear();
        Counters::bump(&self.shared.counters.clears);
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        if self.is_transaction_active() {
            self.rollback_inner("unit of work released")?;
        }
        self.discard_transaction();
        Ok(())
    }

    fn contains(&self, meta: &EntityMeta, key: &Value) -> bool {
        matches!(
            self.managed.get(&(meta.name.to_string(), key.clone())),
            Some(Some(_))
        )
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        if self.is_transaction_active() {
            self.rollback_inner("session closed")?;
        }
        self.discard_transaction();
        self.open = false;
        debug!(session = self.id, "session closed");
        Ok(())
    }
}
