//! Conversion of dispatch outcomes into declared return types.

use super::{Outcome, QueryResult, RowRef};
use crate::connection::Handle;
use crate::core::{DbError, OutParameters, Result, Value};
use std::sync::Arc;

pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch<T>(value: &Value) -> DbError {
    DbError::Mapping(format!(
        "Cannot read {} value '{}' as {}",
        value.type_name(),
        value,
        std::any::type_name::<T>()
    ))
}

/// Affected-row count as a bindable value.
fn count_value(count: u64) -> Result<Value> {
    i64::try_from(count)
        .map(Value::Integer)
        .map_err(|_| DbError::Mapping(format!("Row count {} does not fit in an i64", count)))
}

macro_rules! impl_from_value_integer {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Self> {
                    value
                        .as_i64()
                        .and_then(|i| <$ty>::try_from(i).ok())
                        .ok_or_else(|| mismatch::<$ty>(value))
                }
            }
        )*
    };
}

impl_from_value_integer!(i16, i32, i64, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch::<f64>(value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch::<bool>(value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Null | Value::List(_) => Err(mismatch::<String>(value)),
            other => Ok(other.to_string()),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// Builds a value from one result row.
///
/// Scalars read the first column, tuples read columns by position, and
/// `#[derive(FromRow)]` structs read columns by field name.
pub trait FromRow: Sized {
    fn from_row(row: RowRef<'_>) -> Result<Self>;
}

macro_rules! impl_from_row_scalar {
    ($($ty:ty),*) => {
        $(
            impl FromRow for $ty {
                fn from_row(row: RowRef<'_>) -> Result<Self> {
                    row.get_index(0)
                }
            }
        )*
    };
}

impl_from_row_scalar!(i16, i32, i64, u32, u64, usize, f64, bool, String, Value);

macro_rules! impl_from_row_tuple {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(row: RowRef<'_>) -> Result<Self> {
                Ok(($(row.get_index::<$name>($index)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(A: 0, B: 1);
impl_from_row_tuple!(A: 0, B: 1, C: 2);
impl_from_row_tuple!(A: 0, B: 1, C: 2, D: 3);

fn single_value_row<T: FromRow>(value: &Value) -> Result<T> {
    T::from_row(RowRef::new(&[], std::slice::from_ref(value)))
}

/// The result-materialization contract, keyed by the declared return type.
pub trait FromOutcome: Sized {
    fn from_outcome(outcome: Outcome) -> Result<Self>;

    /// Value substituted when a call returns nothing but the declared type
    /// cannot be empty.
    fn stub() -> Option<Outcome> {
        None
    }
}

/// Convert a dispatch outcome into `T`, passing native values straight through.
pub fn materialize<T: FromOutcome + 'static>(outcome: Outcome) -> Result<T> {
    match outcome {
        Outcome::Native(_) => outcome.into_native::<T>(),
        other => T::from_outcome(other),
    }
}

/// Map the first row of a query outcome; an empty result is an error.
pub fn single_row<T: FromRow>(outcome: Outcome) -> Result<T> {
    match outcome {
        Outcome::Rows(result) => match result.first() {
            Some(row) => T::from_row(row),
            None => Err(DbError::Mapping("Query returned no rows".into())),
        },
        Outcome::Value(value) => single_value_row(&value),
        other => Err(DbError::Mapping(format!(
            "Cannot map {} outcome to a row",
            other.kind()
        ))),
    }
}

impl FromOutcome for () {
    fn from_outcome(_outcome: Outcome) -> Result<Self> {
        Ok(())
    }
}

impl<T: FromRow> FromOutcome for Vec<T> {
    fn from_outcome(outcome: Outcome) -> Result<Self> {
        match outcome {
            Outcome::Unit => Ok(Vec::new()),
            Outcome::Rows(result) => result.iter().map(T::from_row).collect(),
            Outcome::Counts(counts) => counts
                .into_iter()
                .map(|count| single_value_row(&count_value(count)?))
                .collect(),
            Outcome::Value(Value::List(items)) => items.iter().map(single_value_row).collect(),
            other => Err(DbError::Mapping(format!(
                "Cannot map {} outcome to a list",
                other.kind()
            ))),
        }
    }
}

impl<T: FromRow> FromOutcome for Option<T> {
    fn from_outcome(outcome: Outcome) -> Result<Self> {
        match outcome {
            Outcome::Unit | Outcome::Value(Value::Null) => Ok(None),
            Outcome::Rows(result) => result.first().map(T::from_row).transpose(),
            Outcome::Value(value) => single_value_row(&value).map(Some),
            other => Err(DbError::Mapping(format!(
                "Cannot map {} outcome to an optional row",
                other.kind()
            ))),
        }
    }
}

macro_rules! impl_from_outcome_scalar {
    ($($ty:ty => $stub:expr),* $(,)?) => {
        $(
            impl FromOutcome for $ty {
                fn from_outcome(outcome: Outcome) -> Result<Self> {
                    match outcome {
                        Outcome::Count(count) => <$ty>::from_value(&count_value(count)?),
                        Outcome::Value(value) => <$ty>::from_value(&value),
                        Outcome::Unit => match Self::stub() {
                            Some(Outcome::Value(value)) => <$ty>::from_value(&value),
                            _ => Err(DbError::Mapping(format!(
                                "Call returned no value for {}",
                                stringify!($ty)
                            ))),
                        },
                        other => single_row(other),
                    }
                }

                fn stub() -> Option<Outcome> {
                    $stub.map(|value: Value| Outcome::Value(value))
                }
            }
        )*
    };
}

impl_from_outcome_scalar!(
    i32 => Some(Value::Integer(0)),
    i64 => Some(Value::Integer(0)),
    u32 => Some(Value::Integer(0)),
    u64 => Some(Value::Integer(0)),
    usize => Some(Value::Integer(0)),
    f64 => Some(Value::Float(0.0)),
    bool => Some(Value::Boolean(false)),
    String => None::<Value>,
);

impl FromOutcome for QueryResult {
    fn from_outcome(outcome: Outcome) -> Result<Self> {
        match outcome {
            Outcome::Rows(result) => Ok(result),
            Outcome::Unit => Ok(QueryResult::empty()),
            other => Err(DbError::Mapping(format!(
                "Cannot map {} outcome to a query result",
                other.kind()
            ))),
        }
    }
}

impl FromOutcome for OutParameters {
    fn from_outcome(outcome: Outcome) -> Result<Self> {
        match outcome {
            Outcome::Outputs(outputs) => Ok(outputs),
            Outcome::Unit => Ok(OutParameters::new()),
            other => Err(DbError::Mapping(format!(
                "Cannot map {} outcome to call outputs",
                other.kind()
            ))),
        }
    }
}

impl FromOutcome for Arc<Handle> {
    fn from_outcome(outcome: Outcome) -> Result<Self> {
        outcome.into_native()
    }
}
