// ============================================================================
// Transaction State
// ============================================================================
//
// State transitions on a handle:
//
//   NoTransaction ──begin(level)──> InTransaction(level)
//        ^                               │
//        └──────── commit / rollback ────┘
//
// ============================================================================

use crate::connection::Handle;
use crate::core::{IsolationLevel, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    NoTransaction,
    InTransaction(IsolationLevel),
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::InTransaction(_))
    }

    /// Isolation level of the running transaction, if any
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        match self {
            TransactionState::NoTransaction => None,
            TransactionState::InTransaction(level) => Some(*level),
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::NoTransaction => write!(f, "no transaction"),
            TransactionState::InTransaction(level) => write!(f, "in transaction ({})", level),
        }
    }
}

/// Status of the transaction a callback runs in.
///
/// Marking the status rollback-only makes the outermost transaction roll back
/// instead of committing once its body returns successfully.
pub struct TransactionStatus<'a> {
    handle: &'a Handle,
    level: IsolationLevel,
}

impl<'a> TransactionStatus<'a> {
    pub(crate) fn new(handle: &'a Handle, level: IsolationLevel) -> Self {
        Self { handle, level }
    }

    pub fn handle(&self) -> &'a Handle {
        self.handle
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        self.handle.set_rollback_only()
    }

    pub fn is_rollback_only(&self) -> Result<bool> {
        self.handle.is_rollback_only()
    }
}

impl fmt::Debug for TransactionStatus<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("handle", &self.handle.id())
            .field("level", &self.level)
            .finish()
    }
}
