// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Handles own at most one transaction at a time. This module decides whether
// a transactional call opens a new transaction or joins the one already
// running, and carries the per-transaction status given to callbacks.
//
// ============================================================================

pub mod coordinator;
pub mod state;

pub use coordinator::{Decision, reconcile};
pub use state::{TransactionState, TransactionStatus};
