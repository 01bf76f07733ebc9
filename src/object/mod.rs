// ============================================================================
// Sql Object Core
// ============================================================================
//
// A sql object is a proxy generated for a declared interface. The proxy
// holds a `Dispatcher` and routes every method call into it; the dispatcher
// looks the method up in the handler table the registry resolved for the
// interface and runs the bound handler against the shared `Handle`.
//
// ============================================================================

pub mod descriptor;
pub mod dispatcher;
pub mod handler;
pub mod mixin;
pub mod registry;

pub use descriptor::{DeclaredType, Marker, MethodDescriptor, MethodKey, NestedFactory};
pub use dispatcher::{Dispatcher, Invocation};
pub use handler::{Handler, StatementSpec};
pub use mixin::{GetHandle, Transactional};
pub use registry::{CLOSE_HOOK, HandlerRegistry, ResolvedType};

use crate::connection::{Handle, SqlObjectConfig};
use crate::core::{DbError, Result};
use crate::plugins::{Plugin, PluginSet};
use std::any::Any;
use std::sync::Arc;

/// Contract between generated proxies and the dispatch core.
///
/// Implemented by `#[sql_object]` for the proxy struct of each annotated
/// trait.
pub trait SqlObject: Sized + 'static {
    /// Methods, markers and supertypes of the declared interface.
    fn declared_type() -> DeclaredType;

    fn from_dispatcher(dispatcher: Dispatcher) -> Self;

    fn dispatcher(&self) -> &Dispatcher;
}

/// Builds sql objects over handles.
pub struct SqlObjectFactory {
    registry: Arc<HandlerRegistry>,
    plugins: PluginSet,
    config: Arc<SqlObjectConfig>,
}

impl SqlObjectFactory {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        plugins: PluginSet,
        config: Arc<SqlObjectConfig>,
    ) -> Self {
        Self {
            registry,
            plugins,
            config,
        }
    }

    /// Same registry and configuration with `plugin` registered last.
    pub fn with_plugin(&self, plugin: Arc<dyn Plugin>) -> Self {
        Self {
            registry: self.registry.clone(),
            plugins: self.plugins.with(plugin),
            config: self.config.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    pub fn config(&self) -> &Arc<SqlObjectConfig> {
        &self.config
    }

    /// Create a `P` whose calls run against `handle`.
    ///
    /// Resolution faults surface here, before any call is made.
    pub fn attach<P: SqlObject>(self: &Arc<Self>, handle: &Arc<Handle>) -> Result<P> {
        let resolved = self.registry.resolve::<P>(self.config.marker_policy)?;
        let chain = self.registry.chain(&resolved, &self.plugins)?;
        Ok(P::from_dispatcher(Dispatcher::new(
            resolved,
            chain,
            handle.clone(),
            self.clone(),
        )))
    }

    /// Close a sql object through its close hook.
    pub fn close(&self, instance: &dyn Any) -> Result<()> {
        let dispatcher = HandlerRegistry::dispatcher_for(instance)?
            .ok_or_else(|| DbError::NotASqlObject("value passed to close".to_string()))?;
        dispatcher.dispatch(Invocation::new(CLOSE_HOOK), None).map(|_| ())
    }
}
