//! Built-in interfaces a declared type can extend to reach handle facilities.

use super::descriptor::{DeclaredType, MethodDescriptor, MethodKey};
use super::handler::Handler;
use super::{Invocation, SqlObject};
use crate::connection::Handle;
use crate::core::{Arguments, IsolationLevel, Result};
use crate::result::Outcome;
use crate::transaction::TransactionStatus;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Arc;

pub const TRANSACTIONAL: &str = "Transactional";
pub const GET_HANDLE: &str = "GetHandle";

pub const BEGIN: MethodKey = MethodKey::new("begin", &[], "Result<()>");
pub const COMMIT: MethodKey = MethodKey::new("commit", &[], "Result<()>");
pub const ROLLBACK: MethodKey = MethodKey::new("rollback", &[], "Result<()>");
pub const CHECKPOINT: MethodKey = MethodKey::new("checkpoint", &["&str"], "Result<()>");
pub const ROLLBACK_TO_CHECKPOINT: MethodKey =
    MethodKey::new("rollback_to_checkpoint", &["&str"], "Result<()>");
pub const RELEASE_CHECKPOINT: MethodKey =
    MethodKey::new("release_checkpoint", &["&str"], "Result<()>");
pub const IS_IN_TRANSACTION: MethodKey = MethodKey::new("is_in_transaction", &[], "Result<bool>");
pub const IN_TRANSACTION: MethodKey = MethodKey::new("in_transaction", &["F"], "Result<R>");
pub const IN_TRANSACTION_WITH_LEVEL: MethodKey =
    MethodKey::new("in_transaction_with_level", &["IsolationLevel", "F"], "Result<R>");

pub const GET_HANDLE_METHOD: MethodKey = MethodKey::new("get_handle", &[], "Result<Arc<Handle>>");
pub const WITH_HANDLE: MethodKey = MethodKey::new("with_handle", &["F"], "Result<R>");

struct TransactionalMixin;
struct GetHandleMixin;

lazy_static! {
    static ref MIXIN_HANDLERS: HashMap<(&'static str, MethodKey), Handler> = {
        let mut handlers = HashMap::new();
        handlers.insert((TRANSACTIONAL, BEGIN), Handler::Begin);
        handlers.insert((TRANSACTIONAL, COMMIT), Handler::Commit);
        handlers.insert((TRANSACTIONAL, ROLLBACK), Handler::Rollback);
        handlers.insert((TRANSACTIONAL, CHECKPOINT), Handler::Checkpoint);
        handlers.insert((TRANSACTIONAL, ROLLBACK_TO_CHECKPOINT), Handler::RollbackToCheckpoint);
        handlers.insert((TRANSACTIONAL, RELEASE_CHECKPOINT), Handler::ReleaseCheckpoint);
        handlers.insert((TRANSACTIONAL, IS_IN_TRANSACTION), Handler::IsInTransaction);
        handlers.insert((TRANSACTIONAL, IN_TRANSACTION), Handler::InTransaction);
        handlers.insert((TRANSACTIONAL, IN_TRANSACTION_WITH_LEVEL), Handler::InTransaction);
        handlers.insert((GET_HANDLE, GET_HANDLE_METHOD), Handler::GetHandle);
        handlers.insert((GET_HANDLE, WITH_HANDLE), Handler::CallbackWithHandle);
        handlers
    };
}

/// Handler of a method inherited from a built-in interface.
pub fn handler_for(owner: &str, key: &MethodKey) -> Option<Handler> {
    MIXIN_HANDLERS
        .iter()
        .find(|((mixin, mixin_key), _)| *mixin == owner && mixin_key == key)
        .map(|(_, handler)| handler.clone())
}

pub fn transactional() -> DeclaredType {
    [
        BEGIN,
        COMMIT,
        ROLLBACK,
        CHECKPOINT,
        ROLLBACK_TO_CHECKPOINT,
        RELEASE_CHECKPOINT,
        IS_IN_TRANSACTION,
        IN_TRANSACTION,
        IN_TRANSACTION_WITH_LEVEL,
    ]
    .into_iter()
    .fold(
        DeclaredType::new::<TransactionalMixin>(TRANSACTIONAL),
        |declared, key| declared.method(MethodDescriptor::new(key)),
    )
}

pub fn get_handle() -> DeclaredType {
    DeclaredType::new::<GetHandleMixin>(GET_HANDLE)
        .method(MethodDescriptor::new(GET_HANDLE_METHOD))
        .method(MethodDescriptor::new(WITH_HANDLE))
}

fn run_in_transaction<S, R, F>(
    object: &S,
    key: MethodKey,
    level: Option<IsolationLevel>,
    mut callback: F,
) -> Result<R>
where
    S: SqlObject,
    R: 'static,
    F: FnMut(&S, &TransactionStatus<'_>) -> anyhow::Result<R>,
{
    let arguments = Arguments::new().bind("level", level.map(|l| l.as_str()));
    let invocation = Invocation::new(key)
        .arguments(arguments)
        .transaction_callback(|status| Ok(Outcome::native(callback(object, status)?)));
    object.dispatcher().dispatch(invocation, None)?.into_native()
}

fn run_unit<S: SqlObject>(object: &S, key: MethodKey, arguments: Arguments) -> Result<()> {
    object
        .dispatcher()
        .dispatch(Invocation::new(key).arguments(arguments), None)
        .map(|_| ())
}

/// Explicit transaction control on a sql object.
///
/// `begin` keeps an on-demand handle's connection open until the matching
/// `commit` or `rollback`.
pub trait Transactional: SqlObject {
    fn begin(&self) -> Result<()> {
        run_unit(self, BEGIN, Arguments::new())
    }

    fn commit(&self) -> Result<()> {
        run_unit(self, COMMIT, Arguments::new())
    }

    fn rollback(&self) -> Result<()> {
        run_unit(self, ROLLBACK, Arguments::new())
    }

    fn checkpoint(&self, name: &str) -> Result<()> {
        run_unit(self, CHECKPOINT, Arguments::new().bind("name", name))
    }

    fn rollback_to_checkpoint(&self, name: &str) -> Result<()> {
        run_unit(self, ROLLBACK_TO_CHECKPOINT, Arguments::new().bind("name", name))
    }

    fn release_checkpoint(&self, name: &str) -> Result<()> {
        run_unit(self, RELEASE_CHECKPOINT, Arguments::new().bind("name", name))
    }

    fn is_in_transaction(&self) -> Result<bool> {
        self.dispatcher()
            .dispatch(Invocation::new(IS_IN_TRANSACTION), None)?
            .into_native()
    }

    /// Run `callback` in a transaction, joining one that is already open.
    ///
    /// Errors from the callback roll the transaction back; errors that are
    /// not `DbError`s come back as `DbError::CallbackFailure`.
    fn in_transaction<R, F>(&self, callback: F) -> Result<R>
    where
        R: 'static,
        F: FnMut(&Self, &TransactionStatus<'_>) -> anyhow::Result<R>,
    {
        run_in_transaction(self, IN_TRANSACTION, None, callback)
    }

    fn in_transaction_with_level<R, F>(&self, level: IsolationLevel, callback: F) -> Result<R>
    where
        R: 'static,
        F: FnMut(&Self, &TransactionStatus<'_>) -> anyhow::Result<R>,
    {
        run_in_transaction(self, IN_TRANSACTION_WITH_LEVEL, Some(level), callback)
    }
}

/// Access to the handle behind a sql object.
pub trait GetHandle: SqlObject {
    fn get_handle(&self) -> Result<Arc<Handle>> {
        self.dispatcher()
            .dispatch(Invocation::new(GET_HANDLE_METHOD), None)?
            .into_native()
    }

    /// Run `callback` with the handle retained for its whole duration.
    ///
    /// Any error from the callback is reported as `DbError::CallbackFailure`.
    fn with_handle<R, F>(&self, mut callback: F) -> Result<R>
    where
        R: 'static,
        F: FnMut(&Arc<Handle>) -> anyhow::Result<R>,
    {
        let invocation = Invocation::new(WITH_HANDLE)
            .handle_callback(|handle| Ok(Outcome::native(callback(handle)?)));
        self.dispatcher().dispatch(invocation, None)?.into_native()
    }
}
