use super::SqlObjectFactory;
use crate::connection::Handle;
use crate::core::{IsolationLevel, Result};
use crate::result::Outcome;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identity of a declared method: name plus parameter and return types.
///
/// Two keys are equal only when all three parts match, so overloads that
/// differ in parameter types resolve to different handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub name: &'static str,
    pub params: &'static [&'static str],
    pub returns: &'static str,
}

impl MethodKey {
    pub const fn new(
        name: &'static str,
        params: &'static [&'static str],
        returns: &'static str,
    ) -> Self {
        Self {
            name,
            params,
            returns,
        }
    }

    pub fn signature(&self) -> String {
        format!("{}({}) -> {}", self.name, self.params.join(", "), self.returns)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// Builds the proxy of a nested sql object on the same handle.
pub type NestedFactory = fn(&Arc<SqlObjectFactory>, &Arc<Handle>) -> Result<Outcome>;

/// Annotation-like metadata attached to a declared method.
#[derive(Clone)]
pub enum Marker {
    /// Run a query. `None` uses the method name as SQL.
    SqlQuery(Option<&'static str>),
    SqlUpdate(Option<&'static str>),
    SqlBatch(Option<&'static str>),
    SqlCall(Option<&'static str>),
    CreateSqlObject(NestedFactory),
    /// Run the default body in a transaction at an optional isolation level.
    Transaction(Option<IsolationLevel>),
    MaxRows(usize),
    QueryTimeout(Duration),
}

impl Marker {
    pub fn name(&self) -> &'static str {
        match self {
            Marker::SqlQuery(_) => "sql_query",
            Marker::SqlUpdate(_) => "sql_update",
            Marker::SqlBatch(_) => "sql_batch",
            Marker::SqlCall(_) => "sql_call",
            Marker::CreateSqlObject(_) => "create_sql_object",
            Marker::Transaction(_) => "transaction",
            Marker::MaxRows(_) => "max_rows",
            Marker::QueryTimeout(_) => "query_timeout_ms",
        }
    }

    /// Markers that pick a handler category, as opposed to customizers.
    pub fn is_category(&self) -> bool {
        !matches!(self, Marker::MaxRows(_) | Marker::QueryTimeout(_))
    }

    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            Marker::SqlQuery(_) | Marker::SqlUpdate(_) | Marker::SqlBatch(_) | Marker::SqlCall(_)
        )
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::SqlQuery(sql)
            | Marker::SqlUpdate(sql)
            | Marker::SqlBatch(sql)
            | Marker::SqlCall(sql) => write!(f, "{}({:?})", self.name(), sql),
            Marker::CreateSqlObject(_) => write!(f, "create_sql_object"),
            Marker::Transaction(level) => write!(f, "transaction({:?})", level),
            Marker::MaxRows(n) => write!(f, "max_rows({})", n),
            Marker::QueryTimeout(d) => write!(f, "query_timeout_ms({})", d.as_millis()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub key: MethodKey,
    pub markers: Vec<Marker>,
    /// Binding name per parameter, `None` for positional-only parameters.
    pub param_names: Vec<Option<&'static str>>,
    pub has_default: bool,
}

impl MethodDescriptor {
    pub fn new(key: MethodKey) -> Self {
        Self {
            key,
            markers: Vec::new(),
            param_names: Vec::new(),
            has_default: false,
        }
    }

    pub fn marker(mut self, marker: Marker) -> Self {
        self.markers.push(marker);
        self
    }

    pub fn params(mut self, names: &[Option<&'static str>]) -> Self {
        self.param_names = names.to_vec();
        self
    }

    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    pub fn category_markers(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter().filter(|m| m.is_category())
    }

    pub fn max_rows(&self) -> Option<usize> {
        self.markers.iter().find_map(|m| match m {
            Marker::MaxRows(n) => Some(*n),
            _ => None,
        })
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.markers.iter().find_map(|m| match m {
            Marker::QueryTimeout(d) => Some(*d),
            _ => None,
        })
    }
}

/// Reflective description of a sql object interface.
#[derive(Debug, Clone)]
pub struct DeclaredType {
    pub name: &'static str,
    pub id: TypeId,
    pub methods: Vec<MethodDescriptor>,
    pub supertypes: Vec<DeclaredType>,
}

impl DeclaredType {
    /// Describe the interface implemented by proxy type `P`.
    pub fn new<P: 'static>(name: &'static str) -> Self {
        Self {
            name,
            id: TypeId::of::<P>(),
            methods: Vec::new(),
            supertypes: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn extends(mut self, supertype: DeclaredType) -> Self {
        self.supertypes.push(supertype);
        self
    }

    pub fn extends_type(&self, name: &str) -> bool {
        self.supertypes
            .iter()
            .any(|s| s.name == name || s.extends_type(name))
    }

    /// Own methods followed by inherited ones; the first declaration of a
    /// key wins.
    pub fn all_methods(&self) -> Vec<(&'static str, &MethodDescriptor)> {
        let mut seen = Vec::new();
        let mut methods = Vec::new();
        self.collect_methods(&mut seen, &mut methods);
        methods
    }

    fn collect_methods<'a>(
        &'a self,
        seen: &mut Vec<MethodKey>,
        methods: &mut Vec<(&'static str, &'a MethodDescriptor)>,
    ) {
        for method in &self.methods {
            if !seen.contains(&method.key) {
                seen.push(method.key);
                methods.push((self.name, method));
            }
        }
        for supertype in &self.supertypes {
            supertype.collect_methods(seen, methods);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Parent;
    struct Child;

    const FIND: MethodKey = MethodKey::new("find", &["i64"], "Option<String>");
    const FIND_BY_NAME: MethodKey = MethodKey::new("find", &["&str"], "Option<String>");

    #[test]
    fn test_key_identity_includes_types() {
        assert_ne!(FIND, FIND_BY_NAME);
        assert_eq!(FIND.signature(), "find(i64) -> Option<String>");
    }

    #[test]
    fn test_all_methods_prefers_own_declaration() {
        let parent = DeclaredType::new::<Parent>("Parent")
            .method(MethodDescriptor::new(FIND).marker(Marker::SqlQuery(None)))
            .method(MethodDescriptor::new(FIND_BY_NAME).marker(Marker::SqlQuery(None)));
        let child = DeclaredType::new::<Child>("Child")
            .method(MethodDescriptor::new(FIND).marker(Marker::SqlUpdate(None)))
            .extends(parent);

        let methods = child.all_methods();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].0, "Child");
        assert!(matches!(methods[0].1.markers[0], Marker::SqlUpdate(_)));
        assert_eq!(methods[1].0, "Parent");
        assert!(child.extends_type("Parent"));
    }

    #[test]
    fn test_customizers() {
        let method = MethodDescriptor::new(FIND)
            .marker(Marker::SqlQuery(Some("select 1")))
            .marker(Marker::MaxRows(3))
            .marker(Marker::QueryTimeout(Duration::from_millis(250)));

        assert_eq!(method.category_markers().count(), 1);
        assert_eq!(method.max_rows(), Some(3));
        assert_eq!(method.query_timeout(), Some(Duration::from_millis(250)));
    }
}
