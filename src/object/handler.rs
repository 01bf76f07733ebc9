use super::descriptor::NestedFactory;
use super::{Invocation, SqlObjectFactory};
use crate::connection::{Handle, Statement};
use crate::core::{DbError, IsolationLevel, Result, Value};
use crate::result::Outcome;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Retain tag held between an explicit `begin` and its `commit`/`rollback`.
pub const IMPLICIT_TRANSACTION_TAG: &str = "__sqlobject_transaction";

/// SQL text and statement customizations fixed at resolution time.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementSpec {
    pub sql: String,
    pub max_rows: Option<usize>,
    pub query_timeout: Option<Duration>,
}

impl StatementSpec {
    fn build(&self, invocation: &Invocation<'_>) -> Statement {
        Statement::new(self.sql.clone())
            .arguments(invocation.arguments.clone())
            .max_rows(self.max_rows)
            .query_timeout(self.query_timeout)
    }
}

/// What a handler may touch while running one call.
pub struct HandlerContext<'d> {
    pub declared_type: &'static str,
    pub handle: &'d Arc<Handle>,
    pub factory: &'d Arc<SqlObjectFactory>,
    pub closed: &'d AtomicBool,
}

/// Behavior bound to one method of a declared type.
#[derive(Clone)]
pub enum Handler {
    Query(StatementSpec),
    Update(StatementSpec),
    Batch(StatementSpec),
    Call(StatementSpec),
    CreateNestedObject(NestedFactory),
    Close,
    TransactionPassthrough(Option<IsolationLevel>),
    GetHandle,
    CallbackWithHandle,
    Checkpoint,
    RollbackToCheckpoint,
    ReleaseCheckpoint,
    Begin,
    Commit,
    Rollback,
    IsInTransaction,
    InTransaction,
    Forward,
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Handler::Query(_) => "query",
            Handler::Update(_) => "update",
            Handler::Batch(_) => "batch",
            Handler::Call(_) => "call",
            Handler::CreateNestedObject(_) => "create_nested_object",
            Handler::Close => "close",
            Handler::TransactionPassthrough(_) => "transaction_passthrough",
            Handler::GetHandle => "get_handle",
            Handler::CallbackWithHandle => "callback_with_handle",
            Handler::Checkpoint => "checkpoint",
            Handler::RollbackToCheckpoint => "rollback_to_checkpoint",
            Handler::ReleaseCheckpoint => "release_checkpoint",
            Handler::Begin => "begin",
            Handler::Commit => "commit",
            Handler::Rollback => "rollback",
            Handler::IsInTransaction => "is_in_transaction",
            Handler::InTransaction => "in_transaction",
            Handler::Forward => "forward",
        }
    }

    pub fn invoke(
        &self,
        ctx: &HandlerContext<'_>,
        invocation: &mut Invocation<'_>,
    ) -> Result<Outcome> {
        let handle = ctx.handle;
        match self {
            Handler::Query(spec) => Ok(Outcome::Rows(handle.query(&spec.build(invocation))?)),
            Handler::Update(spec) => Ok(Outcome::Count(handle.update(&spec.build(invocation))?)),
            Handler::Batch(spec) => {
                let entries = invocation.arguments.zip_batch()?;
                let statement = spec.build(invocation);
                Ok(Outcome::Counts(handle.batch(&statement, &entries)?))
            }
            Handler::Call(spec) => Ok(Outcome::Outputs(handle.call(&spec.build(invocation))?)),
            Handler::CreateNestedObject(create) => create(ctx.factory, handle),
            Handler::Close => {
                ctx.closed.store(true, Ordering::SeqCst);
                log::debug!("Closed sql object {}", ctx.declared_type);
                Ok(Outcome::Unit)
            }
            Handler::TransactionPassthrough(level) => {
                handle.in_transaction(*level, |_| invocation.call_default())
            }
            Handler::GetHandle => Ok(Outcome::Handle(handle.clone())),
            Handler::CallbackWithHandle => invocation.call_with_handle(handle),
            Handler::Checkpoint => {
                handle.checkpoint(checkpoint_name(invocation)?)?;
                Ok(Outcome::Unit)
            }
            Handler::RollbackToCheckpoint => {
                handle.rollback_to_checkpoint(checkpoint_name(invocation)?)?;
                Ok(Outcome::Unit)
            }
            Handler::ReleaseCheckpoint => {
                handle.release_checkpoint(checkpoint_name(invocation)?)?;
                Ok(Outcome::Unit)
            }
            Handler::Begin => {
                handle.begin(None)?;
                handle.retain(IMPLICIT_TRANSACTION_TAG)?;
                Ok(Outcome::Unit)
            }
            Handler::Commit => {
                let committed = handle.commit();
                finish_transaction(committed, release_implicit_transaction(handle))
            }
            Handler::Rollback => {
                let rolled_back = handle.rollback();
                finish_transaction(rolled_back, release_implicit_transaction(handle))
            }
            Handler::IsInTransaction => Ok(Outcome::native(handle.is_in_transaction()?)),
            Handler::InTransaction => {
                let level = requested_level(invocation)?;
                handle.in_transaction(level, |status| invocation.call_in_transaction(status))
            }
            Handler::Forward => invocation.call_default(),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Query(spec)
            | Handler::Update(spec)
            | Handler::Batch(spec)
            | Handler::Call(spec) => write!(f, "{}({:?})", self.name(), spec.sql),
            Handler::TransactionPassthrough(level) => write!(f, "{}({:?})", self.name(), level),
            other => f.write_str(other.name()),
        }
    }
}

fn checkpoint_name<'i>(invocation: &'i Invocation<'_>) -> Result<&'i str> {
    invocation
        .arguments
        .get(0)
        .and_then(Value::as_str)
        .ok_or_else(|| DbError::Binding("Checkpoint name must be a string".to_string()))
}

fn requested_level(invocation: &Invocation<'_>) -> Result<Option<IsolationLevel>> {
    match invocation.arguments.get(0) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Text(level)) => level.parse().map(Some),
        Some(other) => Err(DbError::Binding(format!(
            "Isolation level must be text, got {}",
            other.type_name()
        ))),
    }
}

fn release_implicit_transaction(handle: &Handle) -> Result<()> {
    if handle.retained(IMPLICIT_TRANSACTION_TAG)? > 0 {
        handle.release(IMPLICIT_TRANSACTION_TAG)?;
    }
    Ok(())
}

/// A commit or rollback failure wins over a failure to release its retain.
fn finish_transaction(ended: Result<()>, released: Result<()>) -> Result<Outcome> {
    match (ended, released) {
        (Ok(()), released) => released.map(|_| Outcome::Unit),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            log::warn!(
                "Suppressed release of '{}' while '{}' propagates: {}",
                IMPLICIT_TRANSACTION_TAG,
                err,
                release_err
            );
            Err(err)
        }
    }
}
