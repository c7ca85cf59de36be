//! Core types shared across relgraph crates
//!
//! This crate provides foundational types used by the object-graph core,
//! the store adapters and the logging facility:
//!
//! - **Identity types**: LocalId, OperationId
//! - **Schema constants**: Canonical field keys and event names

pub mod ids;
pub mod schema;

pub use ids::{LocalId, OperationId};
