//! Change notifications
//!
//! Every registered change is published on its mapping topic, its
//! collection topic and the global topic. Channels are created lazily on
//! first subscription; publishing to a topic nobody listens on is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use super::change::Change;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Global,
    Collection(String),
    Mapping { collection: String, mapping: String },
}

impl Topic {
    pub fn mapping(collection: impl Into<String>, mapping: impl Into<String>) -> Self {
        Topic::Mapping {
            collection: collection.into(),
            mapping: mapping.into(),
        }
    }

    fn for_change(change: &Change) -> [Topic; 3] {
        [
            Topic::mapping(change.collection.clone(), change.mapping.clone()),
            Topic::Collection(change.collection.clone()),
            Topic::Global,
        ]
    }
}

#[derive(Debug)]
pub struct NotificationHub {
    capacity: usize,
    senders: HashMap<Topic, broadcast::Sender<Arc<Change>>>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, topic: Topic) -> broadcast::Receiver<Arc<Change>> {
        let capacity = self.capacity;
        self.senders
            .entry(topic)
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }

    pub fn publish(&self, change: &Arc<Change>) {
        for topic in Topic::for_change(change) {
            if let Some(sender) = self.senders.get(&topic) {
                // Err only means no live receivers
                let _ = sender.send(Arc::clone(change));
            }
        }
    }
}
