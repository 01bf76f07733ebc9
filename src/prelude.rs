//! Everything a module declaring or using sql objects usually needs.

pub use crate::{
    Arguments, BindFields, DbError, Dbi, FromRow, GetHandle, Handle, IsolationLevel, Result,
    SqlObject, Transactional, TransactionStatus, Value, sql_object,
};
