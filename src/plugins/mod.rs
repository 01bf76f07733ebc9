pub mod retry;
pub mod timing;

pub use retry::RetryPlugin;
pub use timing::TimingPlugin;

use crate::core::Result;
use crate::object::{DeclaredType, Invocation, MethodDescriptor, MethodKey};
use crate::result::Outcome;
use std::collections::HashMap;
use std::sync::Arc;

/// Downstream part of the chain as seen by one wrapper.
pub type Next<'n> = &'n mut dyn FnMut(&mut Invocation<'_>) -> Result<Outcome>;

/// Intercepts one invocation.
///
/// A wrapper may run code before and after calling `next`, call it several
/// times, or answer without calling it at all.
pub trait InvocationWrapper: Send + Sync {
    fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<Outcome>;
}

/// Supplies wrappers for the methods of declared types.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wrapper for `method` of `declared`, or `None` to leave it alone.
    fn wrapper_for(
        &self,
        declared: &DeclaredType,
        method: &MethodDescriptor,
    ) -> Option<Arc<dyn InvocationWrapper>>;
}

/// Addresses of the plugins of a set, in registration order.
pub type PluginSetKey = Vec<usize>;

/// Ordered, immutable set of registered plugins.
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new set with `plugin` registered after the existing ones.
    pub fn with(&self, plugin: Arc<dyn Plugin>) -> Self {
        log::info!("Registered sql object plugin: {}", plugin.name());
        let mut plugins = self.plugins.clone();
        plugins.push(plugin);
        Self { plugins }
    }

    /// Identity of the set for the plugin chain cache.
    ///
    /// Two sets holding the same plugin instances in the same order have
    /// equal keys.
    pub fn key(&self) -> PluginSetKey {
        self.plugins
            .iter()
            .map(|plugin| Arc::as_ptr(plugin) as *const () as usize)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}

/// Wrappers per method of one declared type, in registration order.
#[derive(Default)]
pub struct PluginChain {
    wrappers: HashMap<MethodKey, Vec<Arc<dyn InvocationWrapper>>>,
}

impl PluginChain {
    pub fn build(declared: &DeclaredType, plugins: &PluginSet) -> Self {
        let mut wrappers = HashMap::new();
        for (_, method) in declared.all_methods() {
            let chain: Vec<Arc<dyn InvocationWrapper>> = plugins
                .plugins
                .iter()
                .filter_map(|plugin| plugin.wrapper_for(declared, method))
                .collect();
            if !chain.is_empty() {
                wrappers.insert(method.key, chain);
            }
        }
        Self { wrappers }
    }

    pub fn wrappers(&self, method: &MethodKey) -> &[Arc<dyn InvocationWrapper>] {
        self.wrappers.get(method).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }
}

/// Run `invocation` through `wrappers` down to `terminal`.
///
/// The last wrapper is the outermost, so the wrapper registered last sees
/// the call first and the result last.
pub fn run(
    wrappers: &[Arc<dyn InvocationWrapper>],
    invocation: &mut Invocation<'_>,
    terminal: &mut dyn FnMut(&mut Invocation<'_>) -> Result<Outcome>,
) -> Result<Outcome> {
    match wrappers.split_last() {
        None => terminal(invocation),
        Some((outermost, inner)) => {
            outermost.invoke(invocation, &mut |inv: &mut Invocation<'_>| {
                run(inner, inv, &mut *terminal)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const FIND: MethodKey = MethodKey::new("find", &[], "i64");

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl InvocationWrapper for Recorder {
        fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<Outcome> {
            self.log.lock().unwrap().push(format!("{} before", self.label));
            let outcome = next(invocation);
            self.log.lock().unwrap().push(format!("{} after", self.label));
            outcome
        }
    }

    #[test]
    fn test_last_wrapper_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let wrappers: Vec<Arc<dyn InvocationWrapper>> = vec![
            Arc::new(Recorder { label: "w1", log: log.clone() }),
            Arc::new(Recorder { label: "w2", log: log.clone() }),
        ];

        let mut invocation = Invocation::new(FIND);
        let handler_log = log.clone();
        let outcome = run(&wrappers, &mut invocation, &mut |_| {
            handler_log.lock().unwrap().push("handler".to_string());
            Ok(Outcome::Count(1))
        })
        .unwrap();

        assert!(matches!(outcome, Outcome::Count(1)));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["w2 before", "w1 before", "handler", "w1 after", "w2 after"]
        );
    }

    #[test]
    fn test_plugin_set_key_follows_plugin_identity() {
        let timing: Arc<dyn Plugin> = Arc::new(TimingPlugin::new());
        let empty = PluginSet::new();
        let with_timing = empty.with(timing.clone());

        assert_eq!(empty.key(), PluginSet::new().key());
        assert_eq!(with_timing.key(), PluginSet::new().with(timing.clone()).key());
        assert_ne!(empty.key(), with_timing.key());
        assert_ne!(
            with_timing.key(),
            PluginSet::new().with(Arc::new(TimingPlugin::new())).key()
        );
        assert_eq!(with_timing.names(), vec!["timing"]);
        assert!(empty.is_empty());
    }
}
