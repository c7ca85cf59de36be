//! Pending-change ledger
//!
//! Changes are grouped by local identity in registration order. A merge
//! takes a [`LedgerSnapshot`] and, once the store has accepted the result,
//! consumes exactly the changes it saw; anything registered meanwhile
//! stays pending.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use super::change::Change;
use super::notify::{NotificationHub, Topic};
use crate::errors::{GraphError, Result};
use crate::types::LocalId;

#[derive(Debug)]
pub struct ChangeLedger {
    pending: BTreeMap<LocalId, Vec<Arc<Change>>>,
    hub: NotificationHub,
}

/// Point-in-time view of the pending changes
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    batches: Vec<(LocalId, Vec<Arc<Change>>)>,
}

impl LedgerSnapshot {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn identities(&self) -> Vec<LocalId> {
        self.batches.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn batches(&self) -> &[(LocalId, Vec<Arc<Change>>)] {
        &self.batches
    }

    pub fn change_count(&self) -> usize {
        self.batches.iter().map(|(_, c)| c.len()).sum()
    }
}

impl ChangeLedger {
    pub fn new(notification_buffer: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            hub: NotificationHub::new(notification_buffer),
        }
    }

    /// Validate, record and broadcast a change
    ///
    /// # Errors
    ///
    /// Returns `MissingField` if the change is incompletely named.
    pub fn register(&mut self, change: Change) -> Result<Arc<Change>> {
        change.validate()?;
        let change = Arc::new(change);
        trace!(
            local_id = %change.local_id,
            collection = %change.collection,
            mapping = %change.mapping,
            field = %change.field,
            "change registered"
        );
        self.pending
            .entry(change.local_id.clone())
            .or_default()
            .push(Arc::clone(&change));
        self.hub.publish(&change);
        Ok(change)
    }

    pub fn subscribe(&mut self, topic: Topic) -> broadcast::Receiver<Arc<Change>> {
        self.hub.subscribe(topic)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Local ids with pending changes, in ascending order
    pub fn pending_identities(&self) -> Vec<LocalId> {
        self.pending.keys().cloned().collect()
    }

    pub fn changes_for(&self, local_id: &LocalId) -> Vec<Arc<Change>> {
        self.pending.get(local_id).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            batches: self
                .pending
                .iter()
                .map(|(id, changes)| (id.clone(), changes.clone()))
                .collect(),
        }
    }

    /// Drop the changes captured in `snapshot`
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the ledger no longer starts with the
    /// snapshot's changes; nothing is removed in that case.
    pub fn consume(&mut self, snapshot: &LedgerSnapshot) -> Result<()> {
        for (id, merged) in &snapshot.batches {
            let current = self.pending.get(id).map(Vec::as_slice).unwrap_or(&[]);
            let intact = current.len() >= merged.len()
                && current.iter().zip(merged).all(|(a, b)| Arc::ptr_eq(a, b));
            if !intact {
                return Err(GraphError::Internal {
                    message: format!("pending changes for {} were modified during merge", id),
                });
            }
        }
        for (id, merged) in &snapshot.batches {
            if let Some(current) = self.pending.get_mut(id) {
                current.drain(..merged.len());
                if current.is_empty() {
                    self.pending.remove(id);
                }
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeKind;
    use serde_json::json;

    fn set(id: &str, new: i64) -> Change {
        Change::new(
            "c",
            "M",
            LocalId::from(id),
            "n",
            ChangeKind::Set {
                old: json!(new - 1),
                new: json!(new),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_register_groups_by_identity() {
        let mut ledger = ChangeLedger::new(16);
        ledger.register(set("a", 1)).unwrap();
        ledger.register(set("b", 1)).unwrap();
        ledger.register(set("a", 2)).unwrap();

        assert_eq!(ledger.pending_count(), 3);
        let a = ledger.changes_for(&LocalId::from("a"));
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].kind, ChangeKind::Set { old: json!(1), new: json!(2) });
        assert_eq!(
            ledger.pending_identities(),
            vec![LocalId::from("a"), LocalId::from("b")]
        );
    }

    #[test]
    fn test_register_rejects_unnamed_change() {
        let mut ledger = ChangeLedger::new(16);
        let mut change = set("a", 1);
        change.field.clear();
        assert!(ledger.register(change).is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_consume_keeps_later_changes() {
        let mut ledger = ChangeLedger::new(16);
        ledger.register(set("a", 1)).unwrap();
        let snapshot = ledger.snapshot();
        ledger.register(set("a", 2)).unwrap();

        ledger.consume(&snapshot).unwrap();

        let remaining = ledger.changes_for(&LocalId::from("a"));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, ChangeKind::Set { old: json!(1), new: json!(2) });
    }

    #[test]
    fn test_consume_after_clear_fails() {
        let mut ledger = ChangeLedger::new(16);
        ledger.register(set("a", 1)).unwrap();
        let snapshot = ledger.snapshot();
        ledger.clear();
        assert!(ledger.consume(&snapshot).is_err());
    }

    #[test]
    fn test_registered_change_is_broadcast() {
        let mut ledger = ChangeLedger::new(16);
        let mut rx = ledger.subscribe(Topic::Collection("c".into()));
        let registered = ledger.register(set("a", 1)).unwrap();
        let received = rx.try_recv().unwrap();
        assert!(Arc::ptr_eq(&registered, &received));
    }
}
