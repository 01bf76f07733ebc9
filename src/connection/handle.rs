// ============================================================================
// Handle
// ============================================================================
//
// A handle wraps one connection plus the bookkeeping sql objects need:
// tagged retain counts, the context of the executing call, and the state of
// the single transaction the handle may own.
//
// Attached handles own their connection for their whole life. On-demand
// handles open a connection on the first retain and close it on the release
// that brings the retain count back to zero.
//
// ============================================================================

use super::{CallContext, Connection, ConnectionFactory, MarkerPolicy, SqlObjectConfig, Statement};
use crate::core::{Arguments, DbError, IsolationLevel, OutParameters, Result};
use crate::result::QueryResult;
use crate::transaction::{Decision, TransactionState, TransactionStatus, reconcile};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Level, event};
use uuid::Uuid;

enum HandleMode {
    Attached,
    OnDemand(Arc<dyn ConnectionFactory>),
}

#[derive(Default)]
struct HandleState {
    connection: Option<Box<dyn Connection>>,
    retains: HashMap<String, usize>,
    retain_count: usize,
    context: Option<CallContext>,
    transaction: TransactionState,
    rollback_only: bool,
    checkpoints: Vec<String>,
    closed: bool,
}

impl HandleState {
    fn connection(&mut self) -> Result<&mut Box<dyn Connection>> {
        if self.closed {
            return Err(DbError::Handle("Handle is closed".to_string()));
        }
        self.connection.as_mut().ok_or_else(|| {
            DbError::Handle("Handle has no open connection; retain it first".to_string())
        })
    }

    fn require_transaction(&self, operation: &str) -> Result<IsolationLevel> {
        self.transaction
            .isolation_level()
            .ok_or_else(|| {
                DbError::NoTransaction(format!("{} requires an open transaction", operation))
            })
    }

    fn end_transaction(&mut self) {
        self.transaction = TransactionState::NoTransaction;
        self.rollback_only = false;
        self.checkpoints.clear();
    }

    /// Roll back a transaction left open when the connection goes away.
    fn abandon_transaction(&mut self, handle_id: Uuid) {
        if !self.transaction.is_active() {
            return;
        }
        log::warn!(
            "Handle {} released its connection with an open transaction; rolling back",
            handle_id
        );
        if let Some(connection) = self.connection.as_mut() {
            if let Err(e) = connection.rollback() {
                log::warn!("Rollback of abandoned transaction failed: {}", e);
            }
        }
        self.end_transaction();
    }
}

pub struct Handle {
    id: Uuid,
    mode: HandleMode,
    config: Arc<SqlObjectConfig>,
    state: Mutex<HandleState>,
}

impl Handle {
    /// Create a handle that owns `connection` until it is closed or dropped.
    pub fn attached(connection: Box<dyn Connection>, config: Arc<SqlObjectConfig>) -> Arc<Self> {
        let state = HandleState {
            connection: Some(connection),
            ..HandleState::default()
        };
        Arc::new(Self {
            id: Uuid::new_v4(),
            mode: HandleMode::Attached,
            config,
            state: Mutex::new(state),
        })
    }

    /// Create a handle that holds a connection only while retained.
    pub fn on_demand(
        factory: Arc<dyn ConnectionFactory>,
        config: Arc<SqlObjectConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            mode: HandleMode::OnDemand(factory),
            config,
            state: Mutex::new(HandleState::default()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_on_demand(&self) -> bool {
        matches!(self.mode, HandleMode::OnDemand(_))
    }

    pub fn config(&self) -> &SqlObjectConfig {
        &self.config
    }

    pub fn marker_policy(&self) -> MarkerPolicy {
        self.config.marker_policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, HandleState>> {
        Ok(self.state.lock()?)
    }

    /// Whether a connection is currently held.
    pub fn is_open(&self) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.connection.is_some() && !state.closed)
    }

    // ========================================================================
    // Retain / release
    // ========================================================================

    pub fn retain(&self, tag: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(DbError::Handle("Cannot retain a closed handle".to_string()));
        }

        if state.retain_count == 0 && state.connection.is_none() {
            if let HandleMode::OnDemand(factory) = &self.mode {
                state.connection = Some(factory.open()?);
                log::debug!("Handle {} opened on-demand connection", self.id);
            }
        }

        *state.retains.entry(tag.to_string()).or_insert(0) += 1;
        state.retain_count += 1;
        Ok(())
    }

    /// Undo one `retain(tag)`.
    ///
    /// On an on-demand handle the last release closes the connection, and an
    /// error from closing it is returned to the caller.
    pub fn release(&self, tag: &str) -> Result<()> {
        let mut state = self.lock()?;

        match state.retains.get(tag).copied().unwrap_or(0) {
            0 => {
                return Err(DbError::Handle(format!(
                    "Released '{}' more times than it was retained",
                    tag
                )));
            }
            1 => {
                state.retains.remove(tag);
            }
            count => {
                state.retains.insert(tag.to_string(), count - 1);
            }
        }
        state.retain_count -= 1;

        if state.retain_count == 0 && self.is_on_demand() {
            state.abandon_transaction(self.id);
            if let Some(mut connection) = state.connection.take() {
                log::debug!("Handle {} closing on-demand connection", self.id);
                connection.close()?;
            }
        }
        Ok(())
    }

    pub fn retain_count(&self) -> Result<usize> {
        Ok(self.lock()?.retain_count)
    }

    /// Outstanding retains under `tag`.
    pub fn retained(&self, tag: &str) -> Result<usize> {
        Ok(self.lock()?.retains.get(tag).copied().unwrap_or(0))
    }

    // ========================================================================
    // Call context
    // ========================================================================

    /// Install `context` and return the one it replaces.
    pub fn set_context(&self, context: Option<CallContext>) -> Result<Option<CallContext>> {
        let mut state = self.lock()?;
        Ok(std::mem::replace(&mut state.context, context))
    }

    pub fn context(&self) -> Result<Option<CallContext>> {
        Ok(self.lock()?.context.clone())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn transaction_state(&self) -> Result<TransactionState> {
        Ok(self.lock()?.transaction)
    }

    pub fn is_in_transaction(&self) -> Result<bool> {
        Ok(self.lock()?.transaction.is_active())
    }

    pub fn transaction_isolation_level(&self) -> Result<Option<IsolationLevel>> {
        Ok(self.lock()?.transaction.isolation_level())
    }

    /// Begin a transaction and return the isolation level it runs at.
    ///
    /// Without an explicit level the configured default applies, then the
    /// connection's own default.
    pub fn begin(&self, level: Option<IsolationLevel>) -> Result<IsolationLevel> {
        let mut state = self.lock()?;
        if let TransactionState::InTransaction(current) = state.transaction {
            return Err(DbError::Handle(format!(
                "Transaction already open at {}",
                current
            )));
        }

        let default_level = self.config.default_isolation_level;
        let connection = state.connection()?;
        let level = level
            .or(default_level)
            .unwrap_or_else(|| connection.default_isolation_level());
        connection.begin(level)?;

        state.transaction = TransactionState::InTransaction(level);
        state.rollback_only = false;
        state.checkpoints.clear();
        event!(Level::DEBUG, handle = %self.id, level = %level, "transaction opened");
        Ok(level)
    }

    pub fn commit(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.require_transaction("commit")?;
        let result = state.connection()?.commit();
        state.end_transaction();
        event!(Level::DEBUG, handle = %self.id, ok = result.is_ok(), "transaction committed");
        result
    }

    pub fn rollback(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.require_transaction("rollback")?;
        let result = state.connection()?.rollback();
        state.end_transaction();
        event!(Level::DEBUG, handle = %self.id, ok = result.is_ok(), "transaction rolled back");
        result
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.require_transaction("set_rollback_only")?;
        state.rollback_only = true;
        Ok(())
    }

    pub fn is_rollback_only(&self) -> Result<bool> {
        Ok(self.lock()?.rollback_only)
    }

    pub fn checkpoint(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.require_transaction("checkpoint")?;
        state.connection()?.checkpoint(name)?;
        state.checkpoints.push(name.to_string());
        Ok(())
    }

    pub fn rollback_to_checkpoint(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.require_transaction("rollback_to_checkpoint")?;
        let position = Self::checkpoint_position(&state, name)?;
        state.connection()?.rollback_to_checkpoint(name)?;
        // Checkpoints created after this one are gone; this one survives.
        state.checkpoints.truncate(position + 1);
        Ok(())
    }

    pub fn release_checkpoint(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.require_transaction("release_checkpoint")?;
        let position = Self::checkpoint_position(&state, name)?;
        state.connection()?.release_checkpoint(name)?;
        state.checkpoints.truncate(position);
        Ok(())
    }

    fn checkpoint_position(state: &HandleState, name: &str) -> Result<usize> {
        state
            .checkpoints
            .iter()
            .rposition(|c| c == name)
            .ok_or_else(|| DbError::NoTransaction(format!("No checkpoint named '{}'", name)))
    }

    /// Run `body` inside a transaction.
    ///
    /// When the handle already runs a transaction at a compatible level the
    /// body joins it and the outer owner decides the outcome. Otherwise a new
    /// transaction is opened, committed when `body` succeeds (unless marked
    /// rollback-only) and rolled back when it fails.
    pub fn in_transaction<T, F>(&self, level: Option<IsolationLevel>, body: F) -> Result<T>
    where
        F: FnOnce(&TransactionStatus<'_>) -> Result<T>,
    {
        match reconcile(self.transaction_state()?, level)? {
            Decision::PassThrough(current) => body(&TransactionStatus::new(self, current)),
            Decision::Open(requested) => {
                let level = self.begin(requested)?;
                let outcome = body(&TransactionStatus::new(self, level));
                self.finish_transaction(outcome)
            }
        }
    }

    fn finish_transaction<T>(&self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                if !self.is_in_transaction()? {
                    log::warn!("Transaction on handle {} was ended by its body", self.id);
                    return Ok(value);
                }
                if self.is_rollback_only()? {
                    self.rollback()?;
                } else {
                    self.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                if self.is_in_transaction()? {
                    if let Err(rollback_err) = self.rollback() {
                        log::warn!(
                            "Rollback after failed transaction body failed: {}",
                            rollback_err
                        );
                    }
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // Statement execution
    // ========================================================================

    fn prepare(&self, statement: &Statement) -> Result<Statement> {
        let mut prepared = statement.clone();
        if prepared.max_rows.is_none() {
            prepared.max_rows = self.config.max_rows;
        }
        if prepared.query_timeout.is_none() {
            prepared.query_timeout = self.config.query_timeout_duration();
        }
        Ok(prepared)
    }

    fn check(&self, statement: &Statement, arguments: &Arguments) -> Result<()> {
        if self.config.validate_bindings {
            statement.check_bindings(arguments)?;
        }
        Ok(())
    }

    /// Attach the executing call to an engine error.
    fn in_context(state: &HandleState, err: DbError) -> DbError {
        let context = state
            .context
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "<no sql object call>".to_string());
        DbError::Statement {
            context,
            source: Box::new(err),
        }
    }

    pub fn query(&self, statement: &Statement) -> Result<QueryResult> {
        let prepared = self.prepare(statement)?;
        self.check(&prepared, &prepared.arguments)?;

        let mut state = self.lock()?;
        let outcome = state.connection()?.query(&prepared);
        let mut result = outcome.map_err(|e| Self::in_context(&state, e))?;
        if let Some(limit) = prepared.max_rows {
            result.truncate(limit);
        }
        Ok(result)
    }

    pub fn update(&self, statement: &Statement) -> Result<u64> {
        let prepared = self.prepare(statement)?;
        self.check(&prepared, &prepared.arguments)?;

        let mut state = self.lock()?;
        let outcome = state.connection()?.update(&prepared);
        outcome.map_err(|e| Self::in_context(&state, e))
    }

    pub fn batch(&self, statement: &Statement, entries: &[Arguments]) -> Result<Vec<u64>> {
        let prepared = self.prepare(statement)?;
        for entry in entries {
            self.check(&prepared, entry)?;
        }

        let mut state = self.lock()?;
        let outcome = state.connection()?.batch(&prepared, entries);
        outcome.map_err(|e| Self::in_context(&state, e))
    }

    pub fn call(&self, statement: &Statement) -> Result<OutParameters> {
        let prepared = self.prepare(statement)?;
        self.check(&prepared, &prepared.arguments)?;

        let mut state = self.lock()?;
        let outcome = state.connection()?.call(&prepared);
        outcome.map_err(|e| Self::in_context(&state, e))
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Roll back any open transaction and close the connection.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(());
        }
        state.abandon_transaction(self.id);
        state.closed = true;
        match state.connection.take() {
            Some(mut connection) => connection.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.closed {
            return;
        }
        state.abandon_transaction(self.id);
        if let Some(mut connection) = state.connection.take() {
            if let Err(e) = connection.close() {
                log::warn!("Closing connection of dropped handle {} failed: {}", self.id, e);
            }
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("on_demand", &self.is_on_demand())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        begun: Mutex<Vec<IsolationLevel>>,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    struct StubConnection {
        counters: Arc<Counters>,
    }

    impl Connection for StubConnection {
        fn query(&mut self, _statement: &Statement) -> Result<QueryResult> {
            Ok(QueryResult::empty())
        }
        fn update(&mut self, statement: &Statement) -> Result<u64> {
            if statement.sql == "fail" {
                return Err(DbError::ExecutionError("boom".to_string()));
            }
            Ok(1)
        }
        fn batch(&mut self, _statement: &Statement, entries: &[Arguments]) -> Result<Vec<u64>> {
            Ok(vec![1; entries.len()])
        }
        fn call(&mut self, _statement: &Statement) -> Result<OutParameters> {
            Ok(OutParameters::new())
        }
        fn begin(&mut self, level: IsolationLevel) -> Result<()> {
            self.counters.begun.lock().unwrap().push(level);
            Ok(())
        }
        fn commit(&mut self) -> Result<()> {
            self.counters.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn rollback(&mut self) -> Result<()> {
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn checkpoint(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn rollback_to_checkpoint(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn release_checkpoint(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn attached(counters: &Arc<Counters>) -> Arc<Handle> {
        Handle::attached(
            Box::new(StubConnection { counters: counters.clone() }),
            Arc::new(SqlObjectConfig::default()),
        )
    }

    fn on_demand(counters: &Arc<Counters>) -> Arc<Handle> {
        let counters = counters.clone();
        let factory = move || -> Result<Box<dyn Connection>> {
            counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubConnection { counters: counters.clone() }))
        };
        Handle::on_demand(Arc::new(factory), Arc::new(SqlObjectConfig::default()))
    }

    #[test]
    fn test_on_demand_opens_and_closes_with_retains() {
        let counters = Arc::new(Counters::default());
        let handle = on_demand(&counters);
        assert!(!handle.is_open().unwrap());

        handle.retain("a").unwrap();
        handle.retain("b").unwrap();
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(handle.retain_count().unwrap(), 2);

        handle.release("b").unwrap();
        assert!(handle.is_open().unwrap());
        handle.release("a").unwrap();
        assert!(!handle.is_open().unwrap());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_unknown_tag_fails() {
        let counters = Arc::new(Counters::default());
        let handle = attached(&counters);
        handle.retain("a").unwrap();
        assert!(matches!(handle.release("b"), Err(DbError::Handle(_))));
        assert_eq!(handle.retain_count().unwrap(), 1);
    }

    #[test]
    fn test_in_transaction_commits_and_rolls_back() {
        let counters = Arc::new(Counters::default());
        let handle = attached(&counters);

        let value = handle
            .in_transaction(Some(IsolationLevel::Serializable), |status| {
                assert_eq!(status.isolation_level(), IsolationLevel::Serializable);
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(counters.commits.load(Ordering::SeqCst), 1);

        let failed: Result<()> = handle.in_transaction(None, |_| {
            Err(DbError::ExecutionError("body failed".to_string()))
        });
        assert!(matches!(failed, Err(DbError::ExecutionError(_))));
        assert_eq!(counters.rollbacks.load(Ordering::SeqCst), 1);
        assert!(!handle.is_in_transaction().unwrap());
    }

    #[test]
    fn test_nested_transaction_joins_outer() {
        let counters = Arc::new(Counters::default());
        let handle = attached(&counters);

        handle
            .in_transaction(Some(IsolationLevel::RepeatableRead), |_| {
                handle.in_transaction(None, |inner| {
                    assert_eq!(inner.isolation_level(), IsolationLevel::RepeatableRead);
                    Ok(())
                })
            })
            .unwrap();

        assert_eq!(counters.begun.lock().unwrap().len(), 1);
        assert_eq!(counters.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rollback_only_rolls_back_outer() {
        let counters = Arc::new(Counters::default());
        let handle = attached(&counters);

        handle
            .in_transaction(None, |status| {
                status.set_rollback_only()?;
                Ok(())
            })
            .unwrap();

        assert_eq!(counters.commits.load(Ordering::SeqCst), 0);
        assert_eq!(counters.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_level_comes_from_connection() {
        let counters = Arc::new(Counters::default());
        let handle = attached(&counters);
        assert_eq!(handle.begin(None).unwrap(), IsolationLevel::ReadCommitted);
        assert!(matches!(handle.begin(None), Err(DbError::Handle(_))));
        handle.commit().unwrap();
        assert!(matches!(handle.commit(), Err(DbError::NoTransaction(_))));
    }

    #[test]
    fn test_engine_errors_carry_context() {
        let counters = Arc::new(Counters::default());
        let handle = attached(&counters);
        let err = handle.update(&Statement::new("fail")).unwrap_err();
        assert!(matches!(err, DbError::Statement { .. }));
        assert!(matches!(err.root(), DbError::ExecutionError(_)));
    }

    #[test]
    fn test_checkpoints_require_transaction() {
        let counters = Arc::new(Counters::default());
        let handle = attached(&counters);
        assert!(matches!(handle.checkpoint("a"), Err(DbError::NoTransaction(_))));

        handle.begin(None).unwrap();
        handle.checkpoint("a").unwrap();
        handle.checkpoint("b").unwrap();
        handle.rollback_to_checkpoint("a").unwrap();
        assert!(handle.release_checkpoint("b").is_err());
        handle.release_checkpoint("a").unwrap();
        handle.rollback().unwrap();
    }

    #[test]
    fn test_drop_closes_attached_connection() {
        let counters = Arc::new(Counters::default());
        {
            let handle = attached(&counters);
            handle.begin(None).unwrap();
        }
        assert_eq!(counters.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }
}
