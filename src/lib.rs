// ============================================================================
// SqlObject Library
// ============================================================================
//
// Declare a trait of SQL operations, annotate it with `#[sql_object]`, and
// attach the generated proxy to a handle. Each call on the proxy is resolved
// to a handler once per type and dispatched with balanced handle retains,
// restored call context and isolation-aware transaction nesting.
//
// ============================================================================

extern crate self as sqlobject;

pub mod connection;
pub mod core;
pub mod facade;
pub mod object;
pub mod plugins;
pub mod prelude;
pub mod result;
pub mod transaction;

pub use connection::{
    CallContext, Connection, ConnectionFactory, Handle, MarkerPolicy, SqlObjectConfig, Statement,
};
pub use core::{
    Arguments, BindFields, DbError, IsolationLevel, OutParameters, Result, ToValue, Value,
};
pub use facade::Dbi;
pub use object::{
    DeclaredType, Dispatcher, GetHandle, HandlerRegistry, Invocation, Marker, MethodDescriptor,
    MethodKey, SqlObject, SqlObjectFactory, Transactional,
};
pub use plugins::{InvocationWrapper, Plugin, RetryPlugin, TimingPlugin};
pub use result::{FromOutcome, FromRow, FromValue, Outcome, QueryResult, RowRef, materialize};
pub use transaction::{TransactionState, TransactionStatus};

pub use sqlobject_derive::{BindFields, FromRow, sql_object};
