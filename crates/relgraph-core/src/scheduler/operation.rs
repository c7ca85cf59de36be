//! Operations
//!
//! State machine: `Unstarted -> Waiting -> Running -> Completed`. Starting
//! an operation waits for its dependencies; a failed or cancelled
//! dependency registered as must-succeed completes the dependant with
//! `DependencyFailed` without running it. `Completed` is terminal and
//! completion listeners fire exactly once, in registration order.
//!
//! Action work runs on the tokio runtime, so `start` must be called from
//! within one.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::errors::{GraphError, Result};
use crate::types::OperationId;

type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type Listener = Box<dyn FnOnce(&Operation) + Send>;

enum Work {
    Action(Action),
    Nested(Operation),
    Composite(Vec<Operation>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Unstarted,
    Waiting,
    Running,
    Completed,
}

struct Dependency {
    operation: Operation,
    must_succeed: bool,
}

struct Core {
    state: OperationState,
    cancelled: bool,
    work: Option<Work>,
    children: Vec<Operation>,
    dependencies: Vec<Dependency>,
    listeners: Vec<Listener>,
    error: Option<GraphError>,
    abort: Option<AbortHandle>,
    started_at: Option<Instant>,
}

struct Inner {
    id: OperationId,
    name: String,
    core: Mutex<Core>,
    done: watch::Sender<bool>,
}

/// Cloneable handle to a scheduled unit of work
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Inner>,
}

enum Next {
    Wait,
    Fail(String),
    Run(Work),
}

impl Operation {
    /// An operation running `work` once all dependencies have completed
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::with_work(
            name.into(),
            Work::Action(Box::new(move || work().boxed())),
            Vec::new(),
        )
    }

    /// An operation that completes when `child` does, failing if it fails
    pub fn nested(name: impl Into<String>, child: Operation) -> Self {
        Self::with_work(name.into(), Work::Nested(child.clone()), vec![child])
    }

    /// An operation that starts every child at once and completes when the
    /// last one does, failing with the union of their errors
    pub fn composite(name: impl Into<String>, children: Vec<Operation>) -> Self {
        Self::with_work(
            name.into(),
            Work::Composite(children.clone()),
            children,
        )
    }

    fn with_work(name: String, work: Work, children: Vec<Operation>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: OperationId::new(),
                name,
                core: Mutex::new(Core {
                    state: OperationState::Unstarted,
                    cancelled: false,
                    work: Some(work),
                    children,
                    dependencies: Vec::new(),
                    listeners: Vec::new(),
                    error: None,
                    abort: None,
                    started_at: None,
                }),
                done,
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &OperationId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> OperationState {
        self.core().state
    }

    pub fn is_completed(&self) -> bool {
        self.state() == OperationState::Completed
    }

    pub fn is_running(&self) -> bool {
        self.state() == OperationState::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.core().cancelled
    }

    pub fn failed(&self) -> bool {
        self.core().error.is_some()
    }

    pub fn error(&self) -> Option<GraphError> {
        self.core().error.clone()
    }

    pub fn children(&self) -> Vec<Operation> {
        self.core().children.clone()
    }

    /// Whether both handles refer to the same operation
    pub fn ptr_eq(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Require `dependency` to complete before this operation runs
    ///
    /// With `must_succeed`, a dependency that fails or is cancelled
    /// completes this operation with `DependencyFailed`.
    ///
    /// # Errors
    ///
    /// Returns `OperationAlreadyStarted` once this operation has started,
    /// and `InvalidInput` for a self-dependency.
    pub fn add_dependency(&self, dependency: &Operation, must_succeed: bool) -> Result<()> {
        if self.ptr_eq(dependency) {
            return Err(GraphError::InvalidInput {
                reason: format!("operation {} cannot depend on itself", self.name()),
            });
        }
        let mut core = self.core();
        if core.state != OperationState::Unstarted {
            return Err(GraphError::OperationAlreadyStarted {
                operation: self.name().to_string(),
            });
        }
        core.dependencies.push(Dependency {
            operation: dependency.clone(),
            must_succeed,
        });
        Ok(())
    }

    /// Run `listener` on completion, or immediately if already completed
    pub fn on_completion<F>(&self, listener: F)
    where
        F: FnOnce(&Operation) + Send + 'static,
    {
        let mut core = self.core();
        if core.state == OperationState::Completed {
            drop(core);
            listener(self);
        } else {
            core.listeners.push(Box::new(listener));
        }
    }

    /// Begin waiting on dependencies; a no-op unless unstarted
    pub fn start(&self) {
        let dependencies: Vec<Operation> = {
            let mut core = self.core();
            if core.state != OperationState::Unstarted {
                return;
            }
            core.state = OperationState::Waiting;
            core.started_at = Some(Instant::now());
            core.dependencies
                .iter()
                .map(|d| d.operation.clone())
                .collect()
        };
        debug!(
            op = self.name(),
            operation_id = %self.id(),
            dependency_count = dependencies.len(),
            "operation started"
        );
        for dependency in dependencies {
            let this = self.clone();
            dependency.on_completion(move |_| this.evaluate_dependencies());
        }
        self.evaluate_dependencies();
    }

    fn evaluate_dependencies(&self) {
        let next = {
            let mut core = self.core();
            if core.state != OperationState::Waiting {
                return;
            }
            let mut next = None;
            let mut all_completed = true;
            for dependency in &core.dependencies {
                let (completed, failed, cancelled) = dependency.operation.status();
                if !completed {
                    all_completed = false;
                } else if dependency.must_succeed && (failed || cancelled) {
                    next = Some(Next::Fail(dependency.operation.name().to_string()));
                    break;
                }
            }
            let next = match next {
                Some(fail) => fail,
                None if !all_completed => Next::Wait,
                None => match core.work.take() {
                    Some(work) => Next::Run(work),
                    None => Next::Wait,
                },
            };
            if !matches!(next, Next::Wait) {
                core.state = OperationState::Running;
            }
            next
        };

        match next {
            Next::Wait => {}
            Next::Fail(dependency) => self.finish(Some(GraphError::DependencyFailed {
                operation: self.name().to_string(),
                dependency,
            })),
            Next::Run(work) => self.run(work),
        }
    }

    fn status(&self) -> (bool, bool, bool) {
        let core = self.core();
        (
            core.state == OperationState::Completed,
            core.error.is_some(),
            core.cancelled,
        )
    }

    fn run(&self, work: Work) {
        match work {
            Work::Action(action) => {
                if self.is_cancelled() {
                    return;
                }
                let future = action();
                let this = self.clone();
                let handle = tokio::spawn(async move {
                    let result = future.await;
                    this.finish(result.err());
                });
                let mut core = self.core();
                if core.cancelled {
                    // cancelled before the abort handle was stored
                    drop(core);
                    handle.abort();
                } else if core.state != OperationState::Completed {
                    core.abort = Some(handle.abort_handle());
                }
            }
            Work::Nested(child) => {
                let this = self.clone();
                child.on_completion(move |child| {
                    let error = child.error().map(|cause| GraphError::OperationFailed {
                        operation: this.name().to_string(),
                        causes: vec![cause],
                    });
                    this.finish(error);
                });
                child.start();
            }
            Work::Composite(children) => {
                if children.is_empty() {
                    self.finish(None);
                    return;
                }
                let remaining = Arc::new(AtomicUsize::new(children.len()));
                for child in &children {
                    let this = self.clone();
                    let remaining = Arc::clone(&remaining);
                    child.on_completion(move |_| {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            this.finish_composite();
                        }
                    });
                }
                for child in &children {
                    child.start();
                }
            }
        }
    }

    fn finish_composite(&self) {
        let causes: Vec<GraphError> = self
            .children()
            .iter()
            .filter_map(Operation::error)
            .collect();
        let error = (!causes.is_empty()).then(|| GraphError::OperationFailed {
            operation: self.name().to_string(),
            causes,
        });
        self.finish(error);
    }

    fn finish(&self, error: Option<GraphError>) {
        let (listeners, started_at, cancelled) = {
            let mut core = self.core();
            if core.state == OperationState::Completed {
                return;
            }
            core.state = OperationState::Completed;
            if core.error.is_none() {
                core.error = error;
            }
            core.abort = None;
            core.work = None;
            (
                std::mem::take(&mut core.listeners),
                core.started_at,
                core.cancelled,
            )
        };
        self.inner.done.send_replace(true);
        debug!(
            op = self.name(),
            operation_id = %self.id(),
            failed = self.failed(),
            cancelled,
            duration_ms = started_at.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0),
            "operation completed"
        );
        for listener in listeners {
            listener(self);
        }
    }

    /// Cancel this operation and its children
    ///
    /// A running action is aborted. Cancelling a completed operation has no
    /// effect.
    pub fn cancel(&self) {
        let (state, children, abort) = {
            let mut core = self.core();
            if core.state == OperationState::Completed {
                return;
            }
            core.cancelled = true;
            (core.state, core.children.clone(), core.abort.take())
        };
        for child in &children {
            child.cancel();
        }
        if let Some(abort) = abort {
            abort.abort();
        }
        match state {
            OperationState::Unstarted | OperationState::Waiting => self.finish(None),
            // Nested and composite operations finish through their children
            OperationState::Running if children.is_empty() => self.finish(None),
            OperationState::Running | OperationState::Completed => {}
        }
    }

    /// Resolve once the operation has completed
    pub async fn completed(&self) {
        let mut done = self.inner.done.subscribe();
        // Err means the sender is gone, which cannot happen while self lives
        let _ = done.wait_for(|done| *done).await;
    }

    /// Start, wait for completion and surface the error if any
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or `OperationFailed` with no causes if
    /// it was cancelled.
    pub async fn run_to_completion(&self) -> Result<()> {
        self.start();
        self.completed().await;
        match self.error() {
            Some(err) => Err(err),
            None if self.is_cancelled() => Err(GraphError::OperationFailed {
                operation: self.name().to_string(),
                causes: Vec::new(),
            }),
            None => Ok(()),
        }
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &core.state)
            .field("cancelled", &core.cancelled)
            .field("error", &core.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn ok_op(name: &str) -> Operation {
        Operation::new(name, || async { Ok(()) })
    }

    fn failing_op(name: &str) -> Operation {
        Operation::new(name, || async {
            Err(GraphError::Internal {
                message: "boom".into(),
            })
        })
    }

    #[tokio::test]
    async fn test_action_runs_and_completes() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let op = Operation::new("flag", move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        op.run_to_completion().await.unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert!(op.is_completed());
        assert!(!op.failed());
    }

    #[tokio::test]
    async fn test_must_succeed_dependency_failure_skips_work() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let dependency = failing_op("dep");
        let op = Operation::new("dependant", move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        op.add_dependency(&dependency, true).unwrap();

        op.start();
        dependency.start();
        op.completed().await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(matches!(
            op.error(),
            Some(GraphError::DependencyFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_dependant_runs_after_dependency_completes() {
        let dependency = Operation::new("dep", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let seen_completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen_completed);
        let observed = dependency.clone();
        let op = Operation::new("dependant", move || {
            let completed = observed.is_completed();
            async move {
                flag.store(completed, Ordering::SeqCst);
                Ok(())
            }
        });
        op.add_dependency(&dependency, true).unwrap();

        op.start();
        assert_eq!(op.state(), OperationState::Waiting);
        dependency.start();
        op.completed().await;

        assert!(seen_completed.load(Ordering::SeqCst));
        assert!(!op.failed());
    }

    #[tokio::test]
    async fn test_optional_dependency_failure_still_runs() {
        let dependency = failing_op("dep");
        let op = ok_op("dependant");
        op.add_dependency(&dependency, false).unwrap();
        dependency.start();
        op.run_to_completion().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_dependency_after_start_rejected() {
        let op = ok_op("a");
        op.start();
        let err = op.add_dependency(&ok_op("b"), false).unwrap_err();
        assert!(matches!(err, GraphError::OperationAlreadyStarted { .. }));
    }

    #[tokio::test]
    async fn test_completed_is_terminal_and_listeners_fire_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let op = ok_op("a");
        let counter = Arc::clone(&fired);
        op.on_completion(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        op.run_to_completion().await.unwrap();
        op.cancel();
        op.start();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!op.is_cancelled());

        let late = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&late);
        op.on_completion(move |_| flag.store(true, Ordering::SeqCst));
        assert!(late.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_composite_collects_child_errors() {
        let composite = Operation::composite(
            "all",
            vec![failing_op("a"), ok_op("b"), failing_op("c")],
        );
        let err = composite.run_to_completion().await.unwrap_err();
        match err {
            GraphError::OperationFailed { causes, .. } => assert_eq!(causes.len(), 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_composite_completes() {
        Operation::composite("none", Vec::new())
            .run_to_completion()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_nested_propagates_failure() {
        let nested = Operation::nested("outer", failing_op("inner"));
        assert!(nested.run_to_completion().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_running_action() {
        let op = Operation::new("sleepy", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        op.start();
        tokio::task::yield_now().await;
        op.cancel();

        tokio::time::timeout(Duration::from_secs(1), op.completed())
            .await
            .unwrap();
        assert!(op.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_while_action_is_being_spawned_aborts_it() {
        let slot: Arc<Mutex<Option<Operation>>> = Arc::new(Mutex::new(None));
        let ran = Arc::new(AtomicBool::new(false));
        let this = Arc::clone(&slot);
        let flag = Arc::clone(&ran);
        let op = Operation::new("self-cancelling", move || {
            if let Some(op) = this.lock().unwrap().as_ref() {
                op.cancel();
            }
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        *slot.lock().unwrap() = Some(op.clone());

        op.start();
        op.completed().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(op.is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_composite_cancels_children() {
        let child = Operation::new("sleepy", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let composite = Operation::composite("parent", vec![child.clone()]);
        composite.start();
        composite.cancel();

        tokio::time::timeout(Duration::from_secs(1), composite.completed())
            .await
            .unwrap();
        assert!(child.is_cancelled());
        assert!(child.is_completed());
    }

    #[tokio::test]
    async fn test_cancelled_dependency_fails_must_succeed_dependant() {
        let dependency = ok_op("dep");
        let op = ok_op("dependant");
        op.add_dependency(&dependency, true).unwrap();
        op.start();
        dependency.cancel();
        op.completed().await;
        assert!(matches!(
            op.error(),
            Some(GraphError::DependencyFailed { .. })
        ));
    }
}
