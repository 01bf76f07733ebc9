use super::IsolationLevel;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Cannot resolve method '{method}' of '{declared_type}': {reason}")]
    ResolutionFault {
        declared_type: String,
        method: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigurationFault(String),

    #[error(
        "Tried to execute nested transaction with isolation level {requested}, \
         but already running in a transaction with isolation level {current}"
    )]
    TransactionConflict {
        requested: IsolationLevel,
        current: IsolationLevel,
    },

    #[error("Callback failed: {0}")]
    CallbackFailure(#[source] anyhow::Error),

    #[error("{0} is not a sql object")]
    NotASqlObject(String),

    #[error("Sql object '{0}' is closed")]
    ObjectClosed(String),

    #[error("Binding error: {0}")]
    Binding(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("No transaction: {0}")]
    NoTransaction(String),

    #[error("Handle error: {0}")]
    Handle(String),

    #[error("Statement failed in {context}: {source}")]
    Statement {
        context: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Strips statement-context wrappers and returns the error the engine raised.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Statement { source, .. } => source.root(),
            other => other,
        }
    }

    /// Converts an error returned by a user callback.
    ///
    /// Errors that already originate from this crate keep their identity;
    /// anything else becomes a `CallbackFailure` with the original as source.
    pub fn from_callback(err: anyhow::Error) -> Self {
        match err.downcast::<DbError>() {
            Ok(db_err) => db_err,
            Err(other) => Self::CallbackFailure(other),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_statement_context() {
        let err = DbError::Statement {
            context: "Dao::find".into(),
            source: Box::new(DbError::ExecutionError("boom".into())),
        };
        assert!(matches!(err.root(), DbError::ExecutionError(msg) if msg == "boom"));
        assert!(err.to_string().contains("Dao::find"));
    }

    #[test]
    fn test_from_callback_keeps_db_errors() {
        let conflict = DbError::TransactionConflict {
            requested: IsolationLevel::Serializable,
            current: IsolationLevel::ReadCommitted,
        };
        let converted = DbError::from_callback(anyhow::Error::new(conflict));
        assert!(matches!(converted, DbError::TransactionConflict { .. }));

        let converted = DbError::from_callback(anyhow::anyhow!("plain failure"));
        match converted {
            DbError::CallbackFailure(source) => assert_eq!(source.to_string(), "plain failure"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
