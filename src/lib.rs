//! Tessera: an embedded document query engine.
//!
//! Queries move through a fixed lifecycle (parse, rewrite, plan, optimize,
//! execute) inside an MVCC transaction whose write-ahead markers are
//! checked for ordering. Start with [`query::Query`].

#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod mvcc;
pub mod query;
pub mod types;

pub use catalog::Database;
pub use config::EngineConfig;
pub use query::{Query, QueryResult};
pub use types::{ErrorCode, Result, TesseraError};
