pub mod mapping;
pub mod outcome;

use crate::core::{DbError, Result, Value};
pub use mapping::{FromOutcome, FromRow, FromValue, materialize, single_row};
pub use outcome::Outcome;

pub type Row = Vec<Value>;

/// Rows returned by the engine for a query statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    pub fn row(&self, index: usize) -> Option<RowRef<'_>> {
        self.rows.get(index).map(|values| RowRef::new(&self.columns, values))
    }

    pub fn first(&self) -> Option<RowRef<'_>> {
        self.row(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows
            .iter()
            .map(move |values| RowRef::new(&self.columns, values))
    }

    /// Drop every row past `max_rows`.
    pub fn truncate(&mut self, max_rows: usize) {
        self.rows.truncate(max_rows);
    }
}

/// Borrowed view of one row together with its column names.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn new(columns: &'a [String], values: &'a [Value]) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn value(&self, column: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))
            .and_then(|index| self.values.get(index))
    }

    /// Read the column named `column` as `T`.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self
            .value(column)
            .ok_or_else(|| DbError::Mapping(format!("Column '{}' not found in row", column)))?;
        T::from_value(value)
            .map_err(|err| DbError::Mapping(format!("Column '{}': {}", column, err)))
    }

    /// Read the column at `index` as `T`.
    pub fn get_index<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            DbError::Mapping(format!(
                "Column index {} out of range for row of {} columns",
                index,
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }
}
