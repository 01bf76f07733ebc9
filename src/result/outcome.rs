use super::QueryResult;
use crate::connection::Handle;
use crate::core::{DbError, OutParameters, Result, Value};
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;

/// Untyped result of one dispatched call.
///
/// Handlers and plugin wrappers only ever see this form; the generated proxy
/// converts it back into the declared return type.
pub enum Outcome {
    /// The call produced no value.
    Unit,
    Value(Value),
    Count(u64),
    Counts(Vec<u64>),
    Rows(QueryResult),
    Outputs(OutParameters),
    Handle(Arc<Handle>),
    /// A value produced by Rust code (a default method body, a callback or a
    /// nested sql object) carried through dispatch unchanged.
    Native(Box<dyn Any>),
}

impl Outcome {
    pub fn native<T: 'static>(value: T) -> Self {
        if TypeId::of::<T>() == TypeId::of::<()>() {
            return Self::Unit;
        }
        Self::Native(Box::new(value))
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Value(_) => "value",
            Self::Count(_) => "count",
            Self::Counts(_) => "counts",
            Self::Rows(_) => "rows",
            Self::Outputs(_) => "outputs",
            Self::Handle(_) => "handle",
            Self::Native(_) => "native",
        }
    }

    /// Recover a value of type `T`, whatever variant carries it.
    pub fn into_native<T: 'static>(self) -> Result<T> {
        let kind = self.kind();
        let boxed: Box<dyn Any> = match self {
            Self::Unit => Box::new(()),
            Self::Value(value) => Box::new(value),
            Self::Count(count) => Box::new(count),
            Self::Counts(counts) => Box::new(counts),
            Self::Rows(rows) => Box::new(rows),
            Self::Outputs(outputs) => Box::new(outputs),
            Self::Handle(handle) => Box::new(handle),
            Self::Native(boxed) => boxed,
        };
        boxed.downcast::<T>().map(|value| *value).map_err(|_| {
            DbError::Mapping(format!(
                "Cannot convert {} outcome into {}",
                kind,
                type_name::<T>()
            ))
        })
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "Unit"),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Count(count) => f.debug_tuple("Count").field(count).finish(),
            Self::Counts(counts) => f.debug_tuple("Counts").field(counts).finish(),
            Self::Rows(rows) => f.debug_tuple("Rows").field(rows).finish(),
            Self::Outputs(outputs) => f.debug_tuple("Outputs").field(outputs).finish(),
            Self::Handle(handle) => f.debug_tuple("Handle").field(&handle.id()).finish(),
            Self::Native(_) => write!(f, "Native(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_unit_collapses() {
        assert!(Outcome::native(()).is_unit());
        assert!(Outcome::Unit.into_native::<()>().is_ok());
    }

    #[test]
    fn test_native_round_trip_and_mismatch() {
        let outcome = Outcome::native(String::from("Linda"));
        assert_eq!(outcome.into_native::<String>().unwrap(), "Linda");

        let err = Outcome::Count(3).into_native::<String>().unwrap_err();
        assert!(matches!(err, DbError::Mapping(_)));
        assert_eq!(Outcome::Count(3).into_native::<u64>().unwrap(), 3);
    }
}
