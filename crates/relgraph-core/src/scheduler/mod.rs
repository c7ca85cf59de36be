//! Task graph scheduler
//!
//! [`Operation`]s are units of async work with dependencies, completion
//! listeners and cancellation; an operation can also wrap a single nested
//! operation or a set of children that run concurrently. An
//! [`OperationQueue`] admits operations with bounded concurrency.

pub mod operation;
pub mod queue;

pub use operation::{Operation, OperationState};
pub use queue::OperationQueue;
