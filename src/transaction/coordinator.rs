use super::TransactionState;
use crate::core::{DbError, IsolationLevel, Result};

/// What a transactional call does given the handle's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Begin a transaction, at the requested level if one was given.
    Open(Option<IsolationLevel>),
    /// Run inside the transaction already open at this level.
    PassThrough(IsolationLevel),
}

/// Reconcile a requested isolation level with the handle's transaction state.
///
/// A nested call joins the running transaction when it requests no level or
/// the level already in effect. Requesting any other level fails, and nothing
/// runs on the handle.
pub fn reconcile(state: TransactionState, requested: Option<IsolationLevel>) -> Result<Decision> {
    match (state, requested) {
        (TransactionState::NoTransaction, requested) => Ok(Decision::Open(requested)),
        (TransactionState::InTransaction(current), None) => Ok(Decision::PassThrough(current)),
        (TransactionState::InTransaction(current), Some(requested)) if requested == current => {
            Ok(Decision::PassThrough(current))
        }
        (TransactionState::InTransaction(current), Some(requested)) => {
            Err(DbError::TransactionConflict { requested, current })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_when_idle() {
        assert_eq!(
            reconcile(TransactionState::NoTransaction, None).unwrap(),
            Decision::Open(None)
        );
        assert_eq!(
            reconcile(TransactionState::NoTransaction, Some(IsolationLevel::Serializable)).unwrap(),
            Decision::Open(Some(IsolationLevel::Serializable))
        );
    }

    #[test]
    fn test_nested_without_level_passes_through() {
        let state = TransactionState::InTransaction(IsolationLevel::ReadUncommitted);
        assert_eq!(
            reconcile(state, None).unwrap(),
            Decision::PassThrough(IsolationLevel::ReadUncommitted)
        );
    }

    #[test]
    fn test_nested_same_level_passes_through() {
        let state = TransactionState::InTransaction(IsolationLevel::Serializable);
        assert_eq!(
            reconcile(state, Some(IsolationLevel::Serializable)).unwrap(),
            Decision::PassThrough(IsolationLevel::Serializable)
        );
    }

    #[test]
    fn test_nested_different_level_conflicts() {
        let state = TransactionState::InTransaction(IsolationLevel::ReadUncommitted);
        match reconcile(state, Some(IsolationLevel::Serializable)) {
            Err(DbError::TransactionConflict { requested, current }) => {
                assert_eq!(requested, IsolationLevel::Serializable);
                assert_eq!(current, IsolationLevel::ReadUncommitted);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}
