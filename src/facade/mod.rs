pub mod database;

pub use database::Dbi;
