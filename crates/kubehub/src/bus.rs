//! In-process channel carrying locally originated mutations to informers.

use std::sync::Arc;

use kinformer_core::{EventType, Unstructured};
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct MutationNotice {
    /// Backend the mutation was sent to; informers for other backends ignore it.
    pub base_path: String,
    pub event_type: EventType,
    pub items: Vec<Unstructured>,
}

/// Cloneable publish/subscribe handle shared by the mutation client and informers.
#[derive(Debug, Clone)]
pub struct MutationBus {
    tx: broadcast::Sender<Arc<MutationNotice>>,
}

impl MutationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the notice.
    pub fn publish(&self, notice: MutationNotice) -> usize {
        let n = notice.items.len();
        let kind = notice.event_type;
        let delivered = self.tx.send(Arc::new(notice)).unwrap_or(0);
        debug!(event = %kind, items = n, subscribers = delivered, "mutation published");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MutationNotice>> { self.tx.subscribe() }
}

impl Default for MutationBus {
    fn default() -> Self { Self::new(DEFAULT_CAPACITY) }
}
