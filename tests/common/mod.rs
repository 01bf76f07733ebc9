//! In-memory connection used by the integration tests.
//!
//! Stores a single `something (id, name)` table and journals every
//! connection-level event so tests can assert on the exact sequence of
//! opens, transactions and closes.

#![allow(dead_code)]

use sqlobject::{
    Arguments, Connection, ConnectionFactory, DbError, Handle, IsolationLevel, OutParameters,
    QueryResult, Result, SqlObjectConfig, Statement, Value,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Table = BTreeMap<i64, String>;

#[derive(Default)]
struct Store {
    rows: Table,
    journal: Vec<String>,
    statements: Vec<Statement>,
    fail_close: bool,
    open_connections: usize,
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap()
    }

    pub fn connect(&self) -> Box<dyn Connection> {
        let mut store = self.store();
        store.open_connections += 1;
        store.journal.push("open".to_string());
        Box::new(MemoryConnection {
            store: self.store.clone(),
            snapshot: None,
            checkpoints: Vec::new(),
        })
    }

    /// Attached handle with default configuration.
    pub fn handle(&self) -> Arc<Handle> {
        self.handle_with(SqlObjectConfig::default())
    }

    pub fn handle_with(&self, config: SqlObjectConfig) -> Arc<Handle> {
        Handle::attached(self.connect(), Arc::new(config))
    }

    pub fn on_demand_handle(&self) -> Arc<Handle> {
        Handle::on_demand(Arc::new(self.clone()), Arc::new(SqlObjectConfig::default()))
    }

    pub fn insert(&self, id: i64, name: &str) {
        self.store().rows.insert(id, name.to_string());
    }

    pub fn rows(&self) -> Vec<(i64, String)> {
        self.store()
            .rows
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    pub fn journal(&self) -> Vec<String> {
        self.store().journal.clone()
    }

    /// Journal entries that are not statements.
    pub fn transaction_journal(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter(|entry| !entry.starts_with("query") && !entry.starts_with("update"))
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.store().journal.iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn clear_journal(&self) {
        self.store().journal.clear();
    }

    pub fn last_statement(&self) -> Option<Statement> {
        self.store().statements.last().cloned()
    }

    pub fn open_connections(&self) -> usize {
        self.store().open_connections
    }

    pub fn fail_close(&self, enabled: bool) {
        self.store().fail_close = enabled;
    }
}

impl ConnectionFactory for MemoryDatabase {
    fn open(&self) -> Result<Box<dyn Connection>> {
        Ok(self.connect())
    }
}

pub struct MemoryConnection {
    store: Arc<Mutex<Store>>,
    snapshot: Option<Table>,
    checkpoints: Vec<(String, Table)>,
}

impl MemoryConnection {
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap()
    }

    fn execute(rows: &mut Table, sql: &str, arguments: &Arguments) -> Result<u64> {
        let id = bound(sql, arguments, "id").and_then(|v| v.as_i64());
        let name = bound(sql, arguments, "name").and_then(|v| v.as_str().map(str::to_string));
        let lowered = sql.to_ascii_lowercase();

        if lowered.starts_with("insert") {
            let (Some(id), Some(name)) = (id, name) else {
                return Err(DbError::ExecutionError("insert needs :id and :name".into()));
            };
            if rows.contains_key(&id) {
                return Err(DbError::ExecutionError(format!("duplicate key {}", id)));
            }
            rows.insert(id, name);
            Ok(1)
        } else if lowered.starts_with("update") {
            let (Some(id), Some(name)) = (id, name) else {
                return Err(DbError::ExecutionError("update needs :id and :name".into()));
            };
            match rows.get_mut(&id) {
                Some(existing) => {
                    *existing = name;
                    Ok(1)
                }
                None => Ok(0),
            }
        } else if lowered.starts_with("delete") {
            match id {
                Some(id) => Ok(rows.remove(&id).map_or(0, |_| 1)),
                None => {
                    let removed = rows.len() as u64;
                    rows.clear();
                    Ok(removed)
                }
            }
        } else {
            Err(DbError::ExecutionError(format!("unsupported update '{}'", sql)))
        }
    }
}

/// Argument of the placeholder naming `column`, plain (`:id`) or qualified
/// (`:s.id`), falling back to an argument bound under the bare column name.
fn bound(sql: &str, arguments: &Arguments, column: &str) -> Option<Value> {
    placeholder_for(sql, column)
        .and_then(|placeholder| arguments.named(&placeholder).cloned())
        .or_else(|| arguments.named(column).cloned())
}

fn placeholder_for(sql: &str, column: &str) -> Option<String> {
    let qualified = format!(".{}", column);
    Statement::new(sql)
        .placeholders()
        .into_iter()
        .find(|name| name == column || name.ends_with(&qualified))
}

fn reject_failing(sql: &str) -> Result<()> {
    if sql.contains("fail") {
        return Err(DbError::ExecutionError(format!("engine rejected '{}'", sql)));
    }
    Ok(())
}

impl Connection for MemoryConnection {
    fn query(&mut self, statement: &Statement) -> Result<QueryResult> {
        let mut store = self.store();
        store.journal.push(format!("query {}", statement.sql));
        store.statements.push(statement.clone());
        reject_failing(&statement.sql)?;

        let lowered = statement.sql.to_ascii_lowercase();
        if lowered.starts_with("select count") {
            return Ok(QueryResult::new(
                vec!["count".to_string()],
                vec![vec![Value::Integer(store.rows.len() as i64)]],
            ));
        }

        let id = bound(&statement.sql, &statement.arguments, "id").and_then(|v| v.as_i64());
        let name = placeholder_for(&statement.sql, "name")
            .and_then(|placeholder| statement.arguments.named(&placeholder).cloned());
        let rows = store
            .rows
            .iter()
            .filter(|(row_id, _)| id.is_none_or(|id| **row_id == id))
            .filter(|(_, row_name)| {
                name.as_ref()
                    .is_none_or(|name| name.as_str() == Some(row_name.as_str()))
            })
            .map(|(row_id, name)| vec![Value::Integer(*row_id), Value::Text(name.clone())])
            .collect();
        Ok(QueryResult::new(vec!["id".to_string(), "name".to_string()], rows))
    }

    fn update(&mut self, statement: &Statement) -> Result<u64> {
        let mut store = self.store();
        store.journal.push(format!("update {}", statement.sql));
        store.statements.push(statement.clone());
        reject_failing(&statement.sql)?;
        Self::execute(&mut store.rows, &statement.sql, &statement.arguments)
    }

    fn batch(&mut self, statement: &Statement, entries: &[Arguments]) -> Result<Vec<u64>> {
        let mut store = self.store();
        store.journal.push(format!("batch {} x{}", statement.sql, entries.len()));
        store.statements.push(statement.clone());
        reject_failing(&statement.sql)?;
        entries
            .iter()
            .map(|entry| Self::execute(&mut store.rows, &statement.sql, entry))
            .collect()
    }

    fn call(&mut self, statement: &Statement) -> Result<OutParameters> {
        let mut store = self.store();
        store.journal.push(format!("call {}", statement.sql));
        store.statements.push(statement.clone());
        reject_failing(&statement.sql)?;
        let echoed = statement.arguments.get(0).cloned().unwrap_or(Value::Null);
        Ok(OutParameters::new()
            .with("procedure", statement.sql.as_str())
            .with("echo", echoed))
    }

    fn begin(&mut self, level: IsolationLevel) -> Result<()> {
        let mut store = self.store();
        store.journal.push(format!("begin {}", level));
        let snapshot = store.rows.clone();
        drop(store);
        self.snapshot = Some(snapshot);
        self.checkpoints.clear();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.store().journal.push("commit".to_string());
        self.snapshot = None;
        self.checkpoints.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let snapshot = self.snapshot.take();
        let mut store = self.store();
        store.journal.push("rollback".to_string());
        if let Some(rows) = snapshot {
            store.rows = rows;
        }
        drop(store);
        self.checkpoints.clear();
        Ok(())
    }

    fn checkpoint(&mut self, name: &str) -> Result<()> {
        let mut store = self.store();
        store.journal.push(format!("checkpoint {}", name));
        let rows = store.rows.clone();
        drop(store);
        self.checkpoints.push((name.to_string(), rows));
        Ok(())
    }

    fn rollback_to_checkpoint(&mut self, name: &str) -> Result<()> {
        let position = self
            .checkpoints
            .iter()
            .rposition(|(checkpoint, _)| checkpoint == name)
            .ok_or_else(|| DbError::ExecutionError(format!("no checkpoint {}", name)))?;
        let rows = self.checkpoints[position].1.clone();
        self.checkpoints.truncate(position + 1);
        let mut store = self.store();
        store.journal.push(format!("rollback to {}", name));
        store.rows = rows;
        Ok(())
    }

    fn release_checkpoint(&mut self, name: &str) -> Result<()> {
        if let Some(position) = self.checkpoints.iter().rposition(|(c, _)| c == name) {
            self.checkpoints.truncate(position);
        }
        self.store().journal.push(format!("release {}", name));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut store = self.store();
        store.journal.push("close".to_string());
        store.open_connections -= 1;
        if store.fail_close {
            return Err(DbError::ExecutionError("close failed".to_string()));
        }
        Ok(())
    }
}
