// ============================================================================
// Transaction Module
// ============================================================================
//
// Resource-local transactions for units of work: lifecycle state and the
// ordered log of entity changes awaiting flush.
//
// ============================================================================

pub mod change;
pub mod state;

pub use change::Change;
pub use state::{Transaction, TransactionId, TransactionState};
