//! Push-on-change notifications.
//!
//! Every successful store write publishes a `StoreEvent` after the write is
//! visible, so a subscriber that re-reads on an event always sees the new
//! state together with its recomputed statistics.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// A change to the task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// The job record or its statistics changed.
    JobChanged { job_id: Uuid },
    /// A task changed; the owning job's statistics changed with it.
    TaskChanged { job_id: Uuid, task_id: Uuid },
    /// Several tasks of a job changed in one bulk operation.
    TasksChanged { job_id: Uuid, count: u64 },
    /// The job and all of its tasks were removed.
    JobDeleted { job_id: Uuid },
}

impl StoreEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            StoreEvent::JobChanged { job_id }
            | StoreEvent::TaskChanged { job_id, .. }
            | StoreEvent::TasksChanged { job_id, .. }
            | StoreEvent::JobDeleted { job_id } => *job_id,
        }
    }
}

/// Fan-out of store events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let job_id = Uuid::new_v4();

        bus.publish(StoreEvent::JobChanged { job_id });

        assert_eq!(a.recv().await.unwrap().job_id(), job_id);
        assert_eq!(b.recv().await.unwrap().job_id(), job_id);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(StoreEvent::JobDeleted {
            job_id: Uuid::new_v4(),
        });
    }
}
