// ============================================================================
// Unit-of-Work Change Tracking
// ============================================================================
//
// Every write issued through a unit of work is recorded as a `Change`.
// Pending changes are applied to the transaction workspace on flush and
// published to the shared tables on commit; rollback discards them.
//
// ============================================================================

use crate::core::{Row, Value};

/// A single write recorded inside a transaction, applied in program order.
#[derive(Debug, Clone)]
pub enum Change {
    /// Insert a new entity; fails at flush if the key is already stored
    Insert {
        entity: String,
        key: Value,
        row: Row,
    },

    /// Insert or replace the entity stored under `key`
    Merge {
        entity: String,
        key: Value,
        row: Row,
    },

    /// Remove an existing entity; fails at flush if the key is unknown
    Delete { entity: String, key: Value },
}

impl Change {
    /// Get the entity name affected by this change
    pub fn entity_name(&self) -> &str {
        match self {
            Change::Insert { entity, .. } => entity,
            Change::Merge { entity, .. } => entity,
            Change::Delete { entity, .. } => entity,
        }
    }

    pub fn key(&self) -> &Value {
        match self {
            Change::Insert { key, .. } | Change::Merge { key, .. } | Change::Delete { key, .. } => {
                key
            }
        }
    }

    /// Row written by this change, `None` for removals
    pub fn row(&self) -> Option<&Row> {
        match self {
            Change::Insert { row, .. } | Change::Merge { row, .. } => Some(row),
            Change::Delete { .. } => None,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, Change::Delete { .. })
    }
}
