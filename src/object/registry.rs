// ============================================================================
// Type Handler Registry
// ============================================================================
//
// Resolves every method of a declared type to exactly one handler, once per
// (type, marker policy), and caches the plugin chain built for each
// (type, plugin set). Both caches are build-once, read-many: a single build
// lock guards construction of entries that are not cached yet, readers only
// take the read side of the map.
//
// Closing works on any proxy ever resolved, whichever registry resolved it
// and whether or not its entries were evicted since, so the close lookup
// lives in its own process-wide map that only grows.
//
// ============================================================================

use super::descriptor::{DeclaredType, Marker, MethodDescriptor, MethodKey};
use super::handler::{Handler, StatementSpec};
use super::{Dispatcher, SqlObject, mixin};
use crate::connection::MarkerPolicy;
use crate::core::{DbError, Result};
use crate::plugins::{PluginChain, PluginSet, PluginSetKey};
use lazy_static::lazy_static;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Method every handler table carries so any sql object can be closed
/// uniformly, whether or not its type declares `close`.
pub const CLOSE_HOOK: MethodKey = MethodKey::new("__sqlobject_close", &[], "()");

/// Recovers the dispatcher of a proxy known only as `&dyn Any`.
pub type CloseFn = fn(&dyn Any) -> Option<&Dispatcher>;

lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<HandlerRegistry> = Arc::new(HandlerRegistry::new());
    static ref CLOSERS: RwLock<HashMap<TypeId, CloseFn>> = RwLock::new(HashMap::new());
}

/// A declared type together with its handler table.
pub struct ResolvedType {
    pub declared: DeclaredType,
    pub table: HashMap<MethodKey, Handler>,
}

impl ResolvedType {
    pub fn handler(&self, key: &MethodKey) -> Option<&Handler> {
        self.table.get(key)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// A built chain together with the plugins it was built from.
///
/// Holding the plugins keeps their addresses, and so the cache key, from
/// being reused by other plugins while the entry exists.
struct CachedChain {
    chain: Arc<PluginChain>,
    _plugins: PluginSet,
}

pub struct HandlerRegistry {
    tables: RwLock<HashMap<(TypeId, MarkerPolicy), Arc<ResolvedType>>>,
    chains: RwLock<HashMap<(TypeId, PluginSetKey), CachedChain>>,
    build_lock: Mutex<()>,
    builds: AtomicUsize,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            chains: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(()),
            builds: AtomicUsize::new(0),
        }
    }

    /// Process-wide registry used by `Dbi` unless another one is supplied.
    pub fn global() -> Arc<HandlerRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Resolve the handler table of `P`, building it on first use.
    pub fn resolve<P: SqlObject>(&self, policy: MarkerPolicy) -> Result<Arc<ResolvedType>> {
        let key = (TypeId::of::<P>(), policy);
        if let Some(found) = self.tables.read()?.get(&key) {
            return Ok(found.clone());
        }

        let _guard = self.build_lock.lock()?;
        if let Some(found) = self.tables.read()?.get(&key) {
            return Ok(found.clone());
        }

        let declared = P::declared_type();
        let table = build_table(&declared, policy)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        log::debug!("Resolved {} methods of {}", table.len(), declared.name);

        CLOSERS.write()?.entry(key.0).or_insert(dispatcher_of::<P>);
        let resolved = Arc::new(ResolvedType { declared, table });
        self.tables.write()?.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Plugin chain of a resolved type for one plugin set, built on first use.
    ///
    /// Sets holding the same plugins in the same order share one chain.
    pub fn chain(
        &self,
        resolved: &ResolvedType,
        plugins: &PluginSet,
    ) -> Result<Arc<PluginChain>> {
        let key = (resolved.declared.id, plugins.key());
        if let Some(found) = self.chains.read()?.get(&key) {
            return Ok(found.chain.clone());
        }

        let _guard = self.build_lock.lock()?;
        if let Some(found) = self.chains.read()?.get(&key) {
            return Ok(found.chain.clone());
        }

        let chain = Arc::new(PluginChain::build(&resolved.declared, plugins));
        self.chains.write()?.insert(
            key,
            CachedChain {
                chain: chain.clone(),
                _plugins: plugins.clone(),
            },
        );
        Ok(chain)
    }

    /// Number of plugin chains currently cached.
    pub fn chain_count(&self) -> Result<usize> {
        Ok(self.chains.read()?.len())
    }

    /// Dispatcher of `instance` if it is a proxy any registry ever resolved.
    pub fn dispatcher_for(instance: &dyn Any) -> Result<Option<&Dispatcher>> {
        let closer = CLOSERS.read()?.get(&instance.type_id()).copied();
        Ok(closer.and_then(|closer| closer(instance)))
    }

    /// Drop every cached entry of `P`. Objects already attached keep theirs.
    pub fn evict<P: SqlObject>(&self) -> Result<bool> {
        let type_id = TypeId::of::<P>();
        let _guard = self.build_lock.lock()?;
        let mut tables = self.tables.write()?;
        let before = tables.len();
        tables.retain(|(id, _), _| *id != type_id);
        let evicted = tables.len() != before;
        self.chains.write()?.retain(|(id, _), _| *id != type_id);
        Ok(evicted)
    }

    /// Number of handler tables built so far.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatcher_of<P: SqlObject>(instance: &dyn Any) -> Option<&Dispatcher> {
    instance.downcast_ref::<P>().map(SqlObject::dispatcher)
}

// ============================================================================
// Classification
// ============================================================================

fn build_table(
    declared: &DeclaredType,
    policy: MarkerPolicy,
) -> Result<HashMap<MethodKey, Handler>> {
    let mut table = HashMap::new();
    for (owner, method) in declared.all_methods() {
        let handler = classify(declared, owner, method, policy)?;
        table.insert(method.key, handler);
    }
    table.insert(CLOSE_HOOK, Handler::Close);
    Ok(table)
}

/// Position of a category marker in resolution priority order.
fn priority(marker: &Marker) -> u8 {
    match marker {
        Marker::SqlQuery(_) => 0,
        Marker::SqlUpdate(_) => 1,
        Marker::SqlBatch(_) => 2,
        Marker::SqlCall(_) => 3,
        Marker::CreateSqlObject(_) => 4,
        Marker::Transaction(_) => 6,
        Marker::MaxRows(_) | Marker::QueryTimeout(_) => u8::MAX,
    }
}

fn is_close(method: &MethodDescriptor) -> bool {
    method.key.name == "close" && method.key.params.is_empty()
}

fn classify(
    declared: &DeclaredType,
    owner: &'static str,
    method: &MethodDescriptor,
    policy: MarkerPolicy,
) -> Result<Handler> {
    let fault = |reason: String| DbError::ResolutionFault {
        declared_type: declared.name.to_string(),
        method: method.key.signature(),
        reason,
    };

    let mut categories: Vec<&Marker> = method.category_markers().collect();
    categories.sort_by_key(|m| priority(m));

    if categories.len() > 1 && policy == MarkerPolicy::Reject {
        let names: Vec<&str> = categories.iter().map(|m| m.name()).collect();
        return Err(fault(format!("conflicting markers: {}", names.join(", "))));
    }

    let spec = |sql: &Option<&'static str>| StatementSpec {
        sql: sql.unwrap_or(method.key.name).to_string(),
        max_rows: method.max_rows(),
        query_timeout: method.query_timeout(),
    };

    let chosen = categories.first().copied();
    match chosen {
        Some(Marker::SqlQuery(sql)) => return Ok(Handler::Query(spec(sql))),
        Some(Marker::SqlUpdate(sql)) => return Ok(Handler::Update(spec(sql))),
        Some(Marker::SqlBatch(sql)) => return Ok(Handler::Batch(spec(sql))),
        Some(Marker::SqlCall(sql)) => return Ok(Handler::Call(spec(sql))),
        _ => {}
    }

    if method.max_rows().is_some() || method.query_timeout().is_some() {
        return Err(fault(
            "max_rows and query_timeout_ms apply only to statement methods".to_string(),
        ));
    }

    if let Some(Marker::CreateSqlObject(create)) = chosen {
        return Ok(Handler::CreateNestedObject(*create));
    }

    if is_close(method) {
        return Ok(Handler::Close);
    }

    if let Some(Marker::Transaction(level)) = chosen {
        if !method.has_default {
            return Err(DbError::ConfigurationFault(format!(
                "Transactional method '{}' of '{}' has no body",
                method.key, declared.name
            )));
        }
        return Ok(Handler::TransactionPassthrough(*level));
    }

    if let Some(handler) = mixin::handler_for(owner, &method.key) {
        return Ok(handler);
    }

    if method.has_default {
        return Ok(Handler::Forward);
    }

    Err(DbError::ConfigurationFault(format!(
        "Method '{}' of '{}' has neither a sql marker nor a body",
        method.key, declared.name
    )))
}
