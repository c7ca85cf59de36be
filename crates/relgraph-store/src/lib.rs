//! relgraph Store - SQLite persistence for the object graph
//!
//! Provides:
//! - `SqliteDocumentStore`, a `DocumentStore` keeping documents as JSON rows
//! - SQLite schema with an embedded, checksummed migrations framework

pub mod db;
pub mod document_store;
pub mod errors;
pub mod migrations;

pub use document_store::SqliteDocumentStore;
