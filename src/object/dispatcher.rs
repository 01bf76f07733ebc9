// ============================================================================
// Invocation Dispatcher
// ============================================================================
//
// Every call on a sql object proxy arrives here. Calls without a handler run
// their default body untouched. Calls with a handler run inside a call scope
// that installs the call context and retains the handle, and that restores
// and releases on the way out whatever the handler did.
//
// ============================================================================

use super::handler::{Handler, HandlerContext};
use super::registry::ResolvedType;
use super::{MethodKey, SqlObjectFactory};
use crate::connection::{CallContext, Handle};
use crate::core::{Arguments, DbError, Result};
use crate::plugins::{self, PluginChain};
use crate::result::Outcome;
use crate::transaction::TransactionStatus;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Level, event, info_span};

pub type DefaultAction<'a> = Box<dyn FnMut() -> Result<Outcome> + 'a>;
pub type HandleCallback<'a> = Box<dyn FnMut(&Arc<Handle>) -> anyhow::Result<Outcome> + 'a>;
pub type TransactionCallback<'a> =
    Box<dyn FnMut(&TransactionStatus<'_>) -> anyhow::Result<Outcome> + 'a>;

/// One call travelling through the plugin chain to its handler.
pub struct Invocation<'a> {
    method: MethodKey,
    pub arguments: Arguments,
    default_action: Option<DefaultAction<'a>>,
    handle_callback: Option<HandleCallback<'a>>,
    transaction_callback: Option<TransactionCallback<'a>>,
}

impl<'a> Invocation<'a> {
    pub fn new(method: MethodKey) -> Self {
        Self {
            method,
            arguments: Arguments::new(),
            default_action: None,
            handle_callback: None,
            transaction_callback: None,
        }
    }

    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    /// The method's own body, run by forwarding handlers.
    pub fn default_action(mut self, action: impl FnMut() -> Result<Outcome> + 'a) -> Self {
        self.default_action = Some(Box::new(action));
        self
    }

    pub fn handle_callback(
        mut self,
        callback: impl FnMut(&Arc<Handle>) -> anyhow::Result<Outcome> + 'a,
    ) -> Self {
        self.handle_callback = Some(Box::new(callback));
        self
    }

    pub fn transaction_callback(
        mut self,
        callback: impl FnMut(&TransactionStatus<'_>) -> anyhow::Result<Outcome> + 'a,
    ) -> Self {
        self.transaction_callback = Some(Box::new(callback));
        self
    }

    pub fn method(&self) -> MethodKey {
        self.method
    }

    pub fn has_default(&self) -> bool {
        self.default_action.is_some()
    }

    pub fn call_default(&mut self) -> Result<Outcome> {
        match self.default_action.as_mut() {
            Some(action) => action(),
            None => Err(DbError::ConfigurationFault(format!(
                "'{}' has no handler and no default body",
                self.method
            ))),
        }
    }

    pub(crate) fn call_with_handle(&mut self, handle: &Arc<Handle>) -> Result<Outcome> {
        let callback = self.handle_callback.as_mut().ok_or_else(|| {
            DbError::ConfigurationFault(format!("'{}' was called without a callback", self.method))
        })?;
        callback(handle).map_err(DbError::CallbackFailure)
    }

    pub(crate) fn call_in_transaction(
        &mut self,
        status: &TransactionStatus<'_>,
    ) -> Result<Outcome> {
        let callback = self.transaction_callback.as_mut().ok_or_else(|| {
            DbError::ConfigurationFault(format!("'{}' was called without a callback", self.method))
        })?;
        callback(status).map_err(DbError::from_callback)
    }
}

impl fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.method)
            .field("arguments", &self.arguments)
            .finish()
    }
}

/// Retains the handle and installs the call context for one dispatched call.
///
/// `exit` restores and releases and decides which error wins. If the scope
/// is dropped without `exit` (a panic unwinding through the handler) the
/// same cleanup runs in `Drop`.
struct CallScope<'h> {
    handle: &'h Handle,
    tag: String,
    previous: Option<Option<CallContext>>,
}

impl<'h> CallScope<'h> {
    fn enter(handle: &'h Handle, context: CallContext) -> Result<Self> {
        let tag = context.method.signature();
        handle.retain(&tag)?;
        let previous = match handle.set_context(Some(context)) {
            Ok(previous) => previous,
            Err(err) => {
                if let Err(release_err) = handle.release(&tag) {
                    log::warn!("Release after failed context push also failed: {}", release_err);
                }
                return Err(err);
            }
        };
        Ok(Self {
            handle,
            tag,
            previous: Some(previous),
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        let previous = self.previous.take().unwrap_or(None);
        let restored = self.handle.set_context(previous).map(|_| ());
        let released = self.handle.release(&self.tag);
        restored.and(released)
    }

    fn exit(mut self, outcome: Result<Outcome>) -> Result<Outcome> {
        let cleanup = self.cleanup();
        match (outcome, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(cleanup_err)) => {
                log::warn!(
                    "Suppressed release failure of '{}' while '{}' propagates: {}",
                    self.tag,
                    err,
                    cleanup_err
                );
                Err(err)
            }
        }
    }
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        if self.previous.is_some() {
            if let Err(err) = self.cleanup() {
                log::warn!("Release of '{}' during unwind failed: {}", self.tag, err);
            }
        }
    }
}

/// Routes calls on one sql object instance to their handlers.
pub struct Dispatcher {
    resolved: Arc<ResolvedType>,
    chain: Arc<PluginChain>,
    handle: Arc<Handle>,
    factory: Arc<SqlObjectFactory>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(
        resolved: Arc<ResolvedType>,
        chain: Arc<PluginChain>,
        handle: Arc<Handle>,
        factory: Arc<SqlObjectFactory>,
    ) -> Self {
        Self {
            resolved,
            chain,
            handle,
            factory,
            closed: AtomicBool::new(false),
        }
    }

    pub fn declared_type(&self) -> &'static str {
        self.resolved.declared.name
    }

    pub fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub fn factory(&self) -> &Arc<SqlObjectFactory> {
        &self.factory
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Name of the handler bound to `method`, if any.
    pub fn handler_name(&self, method: &MethodKey) -> Option<&'static str> {
        self.resolved.table.get(method).map(Handler::name)
    }

    /// Dispatch one call.
    ///
    /// `stub` stands in for the result when the handler yields no value for
    /// a method whose return type has a natural default.
    pub fn dispatch(
        &self,
        mut invocation: Invocation<'_>,
        stub: Option<Outcome>,
    ) -> Result<Outcome> {
        let method = invocation.method();
        let Some(handler) = self.resolved.table.get(&method) else {
            return invocation.call_default();
        };

        if self.is_closed() && !matches!(handler, Handler::Close) {
            return Err(DbError::ObjectClosed(self.declared_type().to_string()));
        }

        let span = info_span!(
            "sqlobject.dispatch",
            declared_type = %self.declared_type(),
            method = %method,
            handler = handler.name()
        );
        let _enter = span.enter();

        let scope = CallScope::enter(&self.handle, CallContext::new(self.declared_type(), method))?;
        let context = HandlerContext {
            declared_type: self.declared_type(),
            handle: &self.handle,
            factory: &self.factory,
            closed: &self.closed,
        };
        let wrappers = self.chain.wrappers(&method);
        let outcome = plugins::run(wrappers, &mut invocation, &mut |inv| {
            handler.invoke(&context, inv)
        });
        let outcome = scope.exit(outcome);

        match &outcome {
            Ok(result) => event!(Level::DEBUG, outcome = result.kind(), "dispatch complete"),
            Err(err) => event!(Level::ERROR, error = %err, "dispatch failed"),
        }

        let result = outcome?;
        match (result.is_unit(), stub) {
            (true, Some(stub)) => Ok(stub),
            (_, _) => Ok(result),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("declared_type", &self.declared_type())
            .field("handle", &self.handle.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
