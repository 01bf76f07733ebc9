use super::{DbError, Result, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ_UNCOMMITTED",
            Self::ReadCommitted => "READ_COMMITTED",
            Self::RepeatableRead => "REPEATABLE_READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "READ_UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ_COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE_READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            other => Err(DbError::ConfigurationFault(format!(
                "Unknown isolation level '{}'",
                other
            ))),
        }
    }
}

/// One argument of a dispatched call.
///
/// Every argument binds positionally; arguments that carry a name also bind
/// to the `:name` placeholder of the statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    args: Vec<Argument>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument bound both by position and under `name`.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push(Argument {
            name: Some(name.into()),
            value: value.into(),
        });
        self
    }

    /// Add every field of `bean`, named `prefix.field` when a prefix is given.
    pub fn bind_bean<B: BindFields + ?Sized>(self, prefix: Option<&str>, bean: &B) -> Self {
        bean.bind_fields(prefix, self)
    }

    pub fn positional(mut self, value: impl Into<Value>) -> Self {
        self.args.push(Argument {
            name: None,
            value: value.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.args.get(index).map(|arg| &arg.value)
    }

    pub fn named(&self, name: &str) -> Option<&Value> {
        self.args
            .iter()
            .find(|arg| arg.name.as_deref() == Some(name))
            .map(|arg| &arg.value)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.named(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.args.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.args.iter().map(|arg| &arg.value)
    }

    /// Expand list-valued arguments into one argument set per batch entry.
    ///
    /// Lists are zipped element-wise and scalars repeat for every entry. With
    /// no list argument at all the batch has exactly one entry.
    pub fn zip_batch(&self) -> Result<Vec<Arguments>> {
        let mut size: Option<usize> = None;
        for arg in &self.args {
            if let Value::List(items) = &arg.value {
                match size {
                    None => size = Some(items.len()),
                    Some(expected) if expected != items.len() => {
                        return Err(DbError::Binding(format!(
                            "Batch argument '{}' has {} entries, expected {}",
                            arg.name.as_deref().unwrap_or("?"),
                            items.len(),
                            expected
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        let Some(size) = size else {
            return Ok(vec![self.clone()]);
        };

        let entries = (0..size)
            .map(|index| Arguments {
                args: self
                    .args
                    .iter()
                    .map(|arg| Argument {
                        name: arg.name.clone(),
                        value: match &arg.value {
                            Value::List(items) => items[index].clone(),
                            scalar => scalar.clone(),
                        },
                    })
                    .collect(),
            })
            .collect();

        Ok(entries)
    }
}

/// A struct whose fields bind as named arguments.
///
/// `#[derive(BindFields)]` binds each field under its name, or under the
/// name given by `#[column("..")]`. Parameters marked `#[bind_bean("s")]`
/// bind the same fields as `:s.field`.
pub trait BindFields {
    fn bind_fields(&self, prefix: Option<&str>, arguments: Arguments) -> Arguments;
}

impl<T: BindFields + ?Sized> BindFields for &T {
    fn bind_fields(&self, prefix: Option<&str>, arguments: Arguments) -> Arguments {
        (**self).bind_fields(prefix, arguments)
    }
}

/// Name a bean field binds under.
pub fn field_binding_name(prefix: Option<&str>, field: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, field),
        None => field.to_string(),
    }
}

/// Output parameters of a stored-procedure call, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutParameters {
    values: Vec<(String, Value)>,
}

impl OutParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}
