// ============================================================================
// Transaction State Management
// ============================================================================
//
// Each transaction moves through defined states: Active -> Committed/Aborted.
// Writes are buffered as pending changes until they are drained by a flush.
//
// ============================================================================

use super::Change;
use crate::core::{PersistError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state following the State Pattern
///
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// A resource-local transaction owned by one unit of work.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    /// Changes recorded since the last flush
    pending: Vec<Change>,
    /// Number of changes already drained into the workspace
    flushed: usize,
    /// Set when a flush failed; the transaction may only roll back
    rollback_only: bool,
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            pending: Vec::new(),
            flushed: 0,
            rollback_only: false,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn pending_changes(&self) -> &[Change] {
        &self.pending
    }

    /// Total changes recorded, flushed or not
    pub fn change_count(&self) -> usize {
        self.flushed + self.pending.len()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Forbid commit; only `rollback` can end this transaction now.
    pub fn mark_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Record a change in this transaction
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn record_change(&mut self, change: Change) -> Result<()> {
        self.ensure_active("record change")?;
        self.pending.push(change);
        Ok(())
    }

    /// Drain the pending changes, in recording order, for a flush.
    pub fn take_pending(&mut self) -> Result<Vec<Change>> {
        self.ensure_active("flush")?;
        let drained = std::mem::take(&mut self.pending);
        self.flushed += drained.len();
        Ok(drained)
    }

    /// Forget changes that were never flushed.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    /// Mark transaction as committed
    ///
    /// # Errors
    /// Returns error if transaction is not active or marked rollback-only
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        if self.rollback_only {
            return Err(PersistError::TransactionState(format!(
                "Cannot commit: transaction {} is marked rollback-only",
                self.id
            )));
        }
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Mark transaction as aborted and discard changes
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active("rollback")?;
        self.pending.clear();
        self.state = TransactionState::Aborted;
        Ok(())
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if !self.state.is_active() {
            return Err(PersistError::TransactionState(format!(
                "Cannot {}: transaction {} is {}",
                action, self.id, self.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use serde_json::json;

    fn insert(key: i64) -> Change {
        Change::Insert {
            entity: "Post".to_string(),
            key: Value::Integer(key),
            row: json!({"id": key}),
        }
    }

    #[test]
    fn test_transaction_id_generation() {
        let id1 = TransactionId::new();
        let id2 = TransactionId::new();
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_transaction_lifecycle() {
        let mut txn = Transaction::new(TransactionId::new());

        assert_eq!(txn.state(), TransactionState::Active);
        assert!(!txn.state().is_terminal());

        txn.commit().unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.state().is_terminal());
        assert!(txn.commit().is_err());
    }

    #[test]
    fn test_take_pending_keeps_order() {
        let mut txn = Transaction::new(TransactionId::new());
        txn.record_change(insert(1)).unwrap();
        txn.record_change(insert(2)).unwrap();

        let drained = txn.take_pending().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].key(), &Value::Integer(1));
        assert!(txn.pending_changes().is_empty());
        assert_eq!(txn.change_count(), 2);
    }

    #[test]
    fn test_rollback_only_refuses_commit() {
        let mut txn = Transaction::new(TransactionId::new());
        txn.record_change(insert(1)).unwrap();
        txn.mark_rollback_only();

        assert!(txn.is_rollback_only());
        assert!(txn.commit().is_err());
        assert!(txn.state().is_active());
        txn.rollback().unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_rollback_clears_changes() {
        let mut txn = Transaction::new(TransactionId::new());
        txn.record_change(insert(1)).unwrap();

        txn.rollback().unwrap();
        assert!(txn.pending_changes().is_empty());
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(txn.record_change(insert(2)).is_err());
    }
}
