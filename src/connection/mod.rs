pub mod config;
pub mod handle;

use crate::core::{Arguments, DbError, IsolationLevel, OutParameters, Result};
use crate::object::MethodKey;
use crate::result::QueryResult;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

pub use config::{MarkerPolicy, SqlObjectConfig};
pub use handle::Handle;

lazy_static! {
    static ref QUOTED_LITERAL: Regex =
        Regex::new(r"'(?:[^']|'')*'").expect("valid literal pattern");
    static ref NAMED_PARAMETER: Regex =
        Regex::new(r"(?:^|[^:]):([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)")
            .expect("valid placeholder pattern");
}

/// Statement-execution collaborator behind a [`Handle`].
///
/// Implementations own exactly one logical database connection. SQL parsing,
/// parameter substitution and result decoding all happen here; the sql object
/// layer only decides *which* of these operations a declared method maps to.
pub trait Connection: Send {
    fn query(&mut self, statement: &Statement) -> Result<QueryResult>;

    /// Execute an insert/update/delete and return the affected row count.
    fn update(&mut self, statement: &Statement) -> Result<u64>;

    /// Execute `statement` once per entry and return per-entry row counts.
    fn batch(&mut self, statement: &Statement, entries: &[Arguments]) -> Result<Vec<u64>>;

    /// Invoke a stored procedure.
    fn call(&mut self, statement: &Statement) -> Result<OutParameters>;

    fn begin(&mut self, level: IsolationLevel) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    fn checkpoint(&mut self, name: &str) -> Result<()>;
    fn rollback_to_checkpoint(&mut self, name: &str) -> Result<()>;
    fn release_checkpoint(&mut self, name: &str) -> Result<()>;

    fn default_isolation_level(&self) -> IsolationLevel {
        IsolationLevel::ReadCommitted
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens connections for on-demand handles.
pub trait ConnectionFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn Connection>>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Result<Box<dyn Connection>> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn Connection>> {
        self()
    }
}

/// One executable unit built by a statement handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub arguments: Arguments,
    pub max_rows: Option<usize>,
    pub query_timeout: Option<Duration>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            arguments: Arguments::new(),
            max_rows: None,
            query_timeout: None,
        }
    }

    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn max_rows(mut self, max_rows: Option<usize>) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Named `:placeholder`s referenced by the SQL text, outside string literals.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let stripped = QUOTED_LITERAL.replace_all(&self.sql, "''");
        NAMED_PARAMETER
            .captures_iter(&stripped)
            .map(|caps| caps[1].to_string())
            .collect()
    }

    /// Fail if a placeholder has no argument of the same name in `arguments`.
    pub fn check_bindings(&self, arguments: &Arguments) -> Result<()> {
        let missing: Vec<String> = self
            .placeholders()
            .into_iter()
            .filter(|name| !arguments.contains_name(name))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DbError::Binding(format!(
                "No argument bound for :{} in '{}'",
                missing.join(", :"),
                self.sql
            )))
        }
    }
}

/// The declared type and method of the call currently executing on a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub declared_type: &'static str,
    pub method: MethodKey,
}

impl CallContext {
    pub fn new(declared_type: &'static str, method: MethodKey) -> Self {
        Self {
            declared_type,
            method,
        }
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declared_type, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_skip_casts_and_literals() {
        let statement = Statement::new(
            "select id::text, name from something where id = :id and name = :name and note <> ':skip'",
        );
        let names: Vec<String> = statement.placeholders().into_iter().collect();
        assert_eq!(names, vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_qualified_placeholders() {
        let statement = Statement::new(
            "select id, name from something where id = :s.id and name = :s.name.",
        );
        let names: Vec<String> = statement.placeholders().into_iter().collect();
        assert_eq!(names, vec!["s.id".to_string(), "s.name".to_string()]);

        let bound = Arguments::new().bind("s.id", 17i64).bind("s.name", "Phil");
        assert!(statement.check_bindings(&bound).is_ok());
        let plain = Arguments::new().bind("id", 17i64).bind("name", "Phil");
        assert!(statement.check_bindings(&plain).is_err());
    }

    #[test]
    fn test_check_bindings() {
        let statement = Statement::new("insert into something (id, name) values (:id, :name)");
        let bound = Arguments::new().bind("id", 1i64).bind("name", "a");
        assert!(statement.check_bindings(&bound).is_ok());

        let partial = Arguments::new().bind("id", 1i64);
        let err = statement.check_bindings(&partial).unwrap_err();
        assert!(matches!(err, DbError::Binding(msg) if msg.contains(":name")));
    }
}
