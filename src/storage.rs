//! Storage subsystem
//!
//! Structured flow metadata: records, stream rows, segment logs and
//! finalization fields. Payload bytes live in the data capture sink.
//!
//! Components:
//! - `storage_trait`: the `FlowStore` trait the engine is written against.
//! - `types`: identifiers, handles and the records read back from a store.
//! - `database_storage`: SQLite implementation over sqlx.

pub mod database_storage;
pub mod storage_trait;
pub mod types;

pub use database_storage::SqliteStore;
pub use storage_trait::FlowStore;
