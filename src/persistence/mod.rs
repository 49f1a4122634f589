//! Persistent storage for instance records and history

mod database;

pub use database::Database;
