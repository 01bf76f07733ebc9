use crate::connection::{ConnectionFactory, Handle, SqlObjectConfig};
use crate::core::Result;
use crate::object::{HandlerRegistry, SqlObject, SqlObjectFactory};
use crate::plugins::{Plugin, PluginSet};
use std::any::Any;
use std::sync::Arc;

/// Entry point for sql objects.
///
/// Owns the connection factory, the handler registry, the registered plugins
/// and the configuration shared by every handle it opens.
///
/// ```ignore
/// let dbi = Dbi::new(Arc::new(factory));
/// let handle = dbi.open()?;
/// let dao: SomethingDaoProxy = dbi.attach(&handle)?;
/// dao.insert(1, "Brian")?;
/// ```
pub struct Dbi {
    connections: Arc<dyn ConnectionFactory>,
    factory: Arc<SqlObjectFactory>,
    config: Arc<SqlObjectConfig>,
}

impl Dbi {
    /// Dbi over `connections` with default configuration and the global
    /// registry.
    pub fn new(connections: Arc<dyn ConnectionFactory>) -> Self {
        Self::build(
            connections,
            HandlerRegistry::global(),
            Arc::new(SqlObjectConfig::default()),
        )
    }

    pub fn with_config(
        connections: Arc<dyn ConnectionFactory>,
        config: SqlObjectConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(connections, HandlerRegistry::global(), Arc::new(config)))
    }

    /// Use a private registry instead of the global one.
    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.factory = Arc::new(SqlObjectFactory::new(
            registry,
            self.factory.plugins().clone(),
            self.config.clone(),
        ));
        self
    }

    fn build(
        connections: Arc<dyn ConnectionFactory>,
        registry: Arc<HandlerRegistry>,
        config: Arc<SqlObjectConfig>,
    ) -> Self {
        let factory = Arc::new(SqlObjectFactory::new(registry, PluginSet::new(), config.clone()));
        Self {
            connections,
            factory,
            config,
        }
    }

    /// Register `plugin` after the ones already registered.
    ///
    /// Objects attached earlier keep the plugins they were attached with.
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.factory = Arc::new(self.factory.with_plugin(plugin));
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.factory.plugins().names()
    }

    pub fn config(&self) -> &SqlObjectConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.factory.registry()
    }

    /// Open an attached handle. The caller owns it; close it or drop it.
    pub fn open(&self) -> Result<Arc<Handle>> {
        let connection = self.connections.open()?;
        Ok(Handle::attached(connection, self.config.clone()))
    }

    /// Attach a `P` to an existing handle.
    pub fn attach<P: SqlObject>(&self, handle: &Arc<Handle>) -> Result<P> {
        self.factory.attach::<P>(handle)
    }

    /// A `P` over its own on-demand handle: each call opens a connection and
    /// closes it again when the call returns.
    pub fn on_demand<P: SqlObject>(&self) -> Result<P> {
        let handle = Handle::on_demand(self.connections.clone(), self.config.clone());
        self.factory.attach::<P>(&handle)
    }

    /// Close a sql object produced by this mechanism.
    ///
    /// Anything else is rejected with `DbError::NotASqlObject`.
    pub fn close(&self, instance: &dyn Any) -> Result<()> {
        self.factory.close(instance)
    }
}
