//! In-memory document store
//!
//! Used by tests and embedders that persist elsewhere. Notification delivery
//! can be delayed to model an eventually-notifying backend, and writes can
//! be made to fail for chosen documents.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Document, DocumentStore, StoreNotification, WriteResult};
use crate::errors::Result;
use crate::types::LocalId;

#[derive(Debug)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<LocalId, Document>>,
    failing: Mutex<HashSet<LocalId>>,
    notifier: broadcast::Sender<StoreNotification>,
    notification_delay: Option<Duration>,
    put_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(1024);
        Self {
            documents: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            notifier,
            notification_delay: None,
            put_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    /// Deliver write notifications `delay` after the write
    pub fn with_notification_delay(mut self, delay: Duration) -> Self {
        self.notification_delay = Some(delay);
        self
    }

    /// Reject any batch containing `local_id`
    pub fn fail_writes_for(&self, local_id: LocalId) {
        lock(&self.failing).insert(local_id);
    }

    pub fn clear_write_failures(&self) {
        lock(&self.failing).clear();
    }

    /// Seed a document without counting a write or notifying
    pub fn insert(&self, document: Document) {
        lock(&self.documents).insert(document.id.clone(), document);
    }

    pub fn document(&self, local_id: &LocalId) -> Option<Document> {
        lock(&self.documents).get(local_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.documents).is_empty()
    }

    /// Number of `put` calls so far
    pub fn put_count(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Number of `get`/`get_multiple` calls so far
    pub fn get_count(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn notify(&self, written: Vec<LocalId>) {
        let notifier = self.notifier.clone();
        let send = move || {
            for local_id in written {
                // Err only means no live receivers
                let _ = notifier.send(StoreNotification { local_id });
            }
        };
        match self.notification_delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    send();
                });
            }
            None => send(),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, local_id: &LocalId) -> Result<Option<Document>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.document(local_id))
    }

    async fn get_multiple(&self, local_ids: &[LocalId]) -> Result<Vec<Option<Document>>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let documents = lock(&self.documents);
        Ok(local_ids.iter().map(|id| documents.get(id).cloned()).collect())
    }

    async fn put(&self, documents: Vec<Document>) -> Result<Vec<WriteResult>> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let rejected: HashSet<LocalId> = {
            let failing = lock(&self.failing);
            documents
                .iter()
                .filter(|d| failing.contains(&d.id))
                .map(|d| d.id.clone())
                .collect()
        };
        if !rejected.is_empty() {
            debug!(
                document_count = documents.len(),
                rejected = rejected.len(),
                "memory store rejected batch"
            );
            return Ok(documents
                .into_iter()
                .map(|d| {
                    if rejected.contains(&d.id) {
                        WriteResult::failed(d.id, "write rejected")
                    } else {
                        WriteResult::failed(d.id, "batch aborted")
                    }
                })
                .collect());
        }

        let written: Vec<LocalId> = documents.iter().map(|d| d.id.clone()).collect();
        {
            let mut stored = lock(&self.documents);
            for document in documents {
                stored.insert(document.id.clone(), document);
            }
        }
        self.notify(written.clone());
        Ok(written.into_iter().map(WriteResult::ok).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreNotification> {
        self.notifier.subscribe()
    }
}
