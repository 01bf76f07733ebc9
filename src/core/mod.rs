pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, Result};
pub use types::{
    Argument, Arguments, BindFields, IsolationLevel, OutParameters, field_binding_name,
};
pub use value::{ToValue, Value};
