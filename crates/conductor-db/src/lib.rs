//! Persistence layer for conductor.
//!
//! Defines the row models, the connection pool helpers, and the query
//! modules for every table family. All queries are runtime-checked
//! (`sqlx::query_as`) so no live database is required at compile time.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
