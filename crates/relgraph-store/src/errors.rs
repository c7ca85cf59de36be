//! Error helpers for relgraph-store
//!
//! Store failures surface as `GraphError::Store` so the core can treat every
//! document store alike.

use relgraph_core::errors::GraphError;

pub use relgraph_core::errors::Result;

/// Create a migration error
pub fn migration_error(migration_id: &str, reason: &str) -> GraphError {
    GraphError::store(format!("Migration {} failed: {}", migration_id, reason))
}

/// Create a checksum mismatch error
pub fn checksum_mismatch(migration_id: &str, expected: &str, actual: &str) -> GraphError {
    GraphError::store(format!(
        "Checksum mismatch for migration {}: expected {}, got {}",
        migration_id, expected, actual
    ))
}

/// Create a database error from rusqlite::Error
pub fn from_rusqlite(err: rusqlite::Error) -> GraphError {
    GraphError::store(format!("sqlite: {}", err))
}

/// A stored body that is not a JSON object
pub fn corrupt_document(local_id: &str, reason: &str) -> GraphError {
    GraphError::Serialization {
        message: format!("stored document {} is unreadable: {}", local_id, reason),
    }
}
