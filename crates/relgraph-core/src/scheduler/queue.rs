//! Bounded-concurrency operation queue
//!
//! Operations are admitted in FIFO order while the queue is started and
//! fewer than `max_concurrent` are running. Each completion admits the
//! next queued operation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::operation::Operation;

struct QueueCore {
    max_concurrent: usize,
    started: bool,
    running: Vec<Operation>,
    queued: VecDeque<Operation>,
}

struct QueueInner {
    name: String,
    core: Mutex<QueueCore>,
}

#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    /// A stopped queue; `max_concurrent` is clamped to at least one
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                core: Mutex::new(QueueCore {
                    max_concurrent: max_concurrent.max(1),
                    started: false,
                    running: Vec::new(),
                    queued: VecDeque::new(),
                }),
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, QueueCore> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_concurrent_operations(&self) -> usize {
        self.core().max_concurrent
    }

    pub fn running_count(&self) -> usize {
        self.core().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.core().queued.len()
    }

    pub fn is_started(&self) -> bool {
        self.core().started
    }

    /// Run `operation` now if there is capacity, otherwise enqueue it
    pub fn add_operation(&self, operation: Operation) {
        self.core().queued.push_back(operation);
        self.admit();
    }

    pub fn start(&self) {
        self.core().started = true;
        self.admit();
    }

    /// Stop admitting operations, optionally cancelling those running
    pub fn stop(&self, cancel_running: bool) {
        let running = {
            let mut core = self.core();
            core.started = false;
            if cancel_running {
                core.running.clone()
            } else {
                Vec::new()
            }
        };
        for operation in running {
            operation.cancel();
        }
    }

    fn admit(&self) {
        let admitted = {
            let mut core = self.core();
            let mut admitted = Vec::new();
            while core.started && core.running.len() < core.max_concurrent {
                match core.queued.pop_front() {
                    Some(operation) => {
                        core.running.push(operation.clone());
                        admitted.push(operation);
                    }
                    None => break,
                }
            }
            admitted
        };
        for operation in admitted {
            trace!(
                queue = self.name(),
                op = operation.name(),
                "operation admitted"
            );
            let queue = self.clone();
            operation.on_completion(move |done| queue.operation_finished(done));
            operation.start();
        }
    }

    fn operation_finished(&self, operation: &Operation) {
        self.core().running.retain(|r| !r.ptr_eq(operation));
        self.admit();
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core();
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.name)
            .field("max_concurrent", &core.max_concurrent)
            .field("started", &core.started)
            .field("running", &core.running.len())
            .field("queued", &core.queued.len())
            .finish()
    }
}
