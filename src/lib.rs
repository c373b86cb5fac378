//! Document-store ORM core.
//!
//! Bridges a SQL-shaped query surface onto a document engine whose
//! native language is a JSON aggregation pipeline. Three layers:
//!
//! - a SQL lexer/parser and a translator emitting engine commands,
//! - a fluent model-query runtime with schema-aware field mapping,
//!   relation includes and transactions,
//! - a raw executor accepting either SQL or JSON command documents.
//!
//! The engine itself is opaque behind [`engine::DocumentEngine`];
//! [`engine::MemoryEngine`] ships as the in-process reference
//! implementation.

pub mod db;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod query;
pub mod schema;
pub mod sql;
pub mod sync;
pub mod translate;
pub mod txn;
pub mod types;

mod raw;

pub use db::{ConnectOptions, Database};
pub use error::{Error, Result};
pub use query::{IncludeOptions, ModelQuery, SelectQuery, WriteResult};
pub use schema::{Field, FieldType, Relation, RelationKind, Schema};
pub use types::{Command, Condition, SortDirection};
pub use txn::Transaction;
