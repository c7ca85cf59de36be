//! Merge engine
//!
//! Persists pending changes: fetch the affected documents, replay each
//! identity's changes onto its document, write them back in one batch, and
//! (when configured) wait until the store has announced every write. Only
//! then are the merged changes consumed from the ledger. On any failure the
//! ledger is left as it was, so a later merge retries the same changes.
//!
//! Merges run one at a time through a single-slot operation queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, warn};

use crate::config::MergeConfig;
use crate::errors::{GraphError, Result};
use crate::graph::Graph;
use crate::scheduler::{Operation, OperationQueue};
use crate::store::{Document, DocumentStore, StoreNotification};
use crate::types::LocalId;
use crate::{log_op_end, log_op_error, log_op_start};

/// Summary of a completed merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Local ids whose documents were written
    pub identities: Vec<LocalId>,
    pub change_count: usize,
}

impl MergeReport {
    pub fn document_count(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

pub(crate) struct MergeEngine {
    queue: OperationQueue,
    await_notifications: bool,
}

impl MergeEngine {
    pub(crate) fn new(config: &MergeConfig) -> Self {
        let queue = OperationQueue::new("merge", 1);
        queue.start();
        Self {
            queue,
            await_notifications: config.await_notifications,
        }
    }

    pub(crate) async fn merge(&self, graph: Graph) -> Result<MergeReport> {
        let report: Arc<Mutex<Option<MergeReport>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&report);
        let await_notifications = self.await_notifications;
        let operation = Operation::new("merge_changes", move || async move {
            let merged = merge_pending(graph, await_notifications).await?;
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(merged);
            Ok(())
        });
        self.queue.add_operation(operation.clone());
        operation.completed().await;
        if let Some(err) = operation.error() {
            return Err(err);
        }
        let merged = report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        Ok(merged)
    }
}

async fn merge_pending(graph: Graph, await_notifications: bool) -> Result<MergeReport> {
    let snapshot = graph.state().ledger.snapshot();
    if snapshot.is_empty() {
        debug!("merge skipped: no pending changes");
        return Ok(MergeReport::default());
    }

    let start = Instant::now();
    let identities = snapshot.identities();
    let change_count = snapshot.change_count();
    log_op_start!(
        "merge_changes",
        document_count = identities.len(),
        change_count
    );

    let result = write_snapshot(&graph, &snapshot, await_notifications).await;
    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(()) => {
            graph.state().ledger.consume(&snapshot)?;
            log_op_end!(
                "merge_changes",
                duration_ms = duration_ms,
                document_count = identities.len(),
                change_count
            );
            Ok(MergeReport {
                identities,
                change_count,
            })
        }
        Err(err) => {
            log_op_error!("merge_changes", err.clone(), duration_ms = duration_ms);
            Err(err)
        }
    }
}

async fn write_snapshot(
    graph: &Graph,
    snapshot: &crate::changes::LedgerSnapshot,
    await_notifications: bool,
) -> Result<()> {
    let store = graph.store();
    // Subscribe before writing so no notification can be missed
    let mut notifications = store.subscribe();

    let identities = snapshot.identities();
    let existing = store.get_multiple(&identities).await?;
    if existing.len() != identities.len() {
        return Err(GraphError::store(format!(
            "store returned {} documents for {} ids",
            existing.len(),
            identities.len()
        )));
    }

    let mut documents = Vec::with_capacity(identities.len());
    for ((local_id, changes), document) in snapshot.batches().iter().zip(existing) {
        let mut document = match document {
            Some(document) => document,
            None => {
                let first = changes.first().ok_or_else(|| GraphError::Internal {
                    message: format!("empty change batch for {}", local_id),
                })?;
                Document::empty(local_id.clone(), first.collection.clone(), first.mapping.clone())
            }
        };
        for change in changes {
            change.apply(&mut document)?;
        }
        documents.push(document);
    }

    let results = store.put(documents.clone()).await?;
    let failures: Vec<GraphError> = results
        .into_iter()
        .filter_map(|r| {
            r.error.map(|message| {
                GraphError::store(format!("write of {} failed: {}", r.local_id, message))
            })
        })
        .collect();
    if !failures.is_empty() {
        return Err(GraphError::OperationFailed {
            operation: "merge_changes".to_string(),
            causes: failures,
        });
    }

    if await_notifications {
        await_written(&mut notifications, store.as_ref(), &documents).await?;
    }
    Ok(())
}

/// Wait until the store has announced every written document. If the
/// notification stream lagged, confirm the rest by reading them back.
async fn await_written(
    notifications: &mut Receiver<StoreNotification>,
    store: &dyn DocumentStore,
    written: &[Document],
) -> Result<()> {
    let mut waiting: HashSet<LocalId> = written.iter().map(|d| d.id.clone()).collect();
    while !waiting.is_empty() {
        match notifications.recv().await {
            Ok(notification) => {
                waiting.remove(&notification.local_id);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "store notifications lagged; confirming writes directly");
                let expected: HashMap<&LocalId, &Document> =
                    written.iter().map(|d| (&d.id, d)).collect();
                let ids: Vec<LocalId> = waiting.iter().cloned().collect();
                let current = store.get_multiple(&ids).await?;
                for (id, document) in ids.iter().zip(current) {
                    if document.as_ref() == expected.get(id).copied() {
                        waiting.remove(id);
                    }
                }
            }
            Err(RecvError::Closed) => {
                return Err(GraphError::store(
                    "notification stream closed before all writes were announced",
                ));
            }
        }
    }
    Ok(())
}
