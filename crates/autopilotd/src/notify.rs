//! Store notifications and the observer registry that fans them out.
//!
//! Each subscriber owns an unbounded channel. A publish sends to every live
//! subscriber while holding the registry lock, so notifications from one
//! publisher arrive in publish order. Closed receivers are pruned on publish.

use std::sync::{Mutex, PoisonError};

use autopilot_core::{Id, TaskStatus};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreNotification {
    TaskCreated {
        task_id: Id,
    },
    TaskTransitioned {
        task_id: Id,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskAmended {
        task_id: Id,
    },
    CriticResultRecorded {
        critic: String,
        passed: bool,
        origin: String,
    },
    DecisionRecorded {
        task_id: Id,
        consensus: bool,
    },
}

impl StoreNotification {
    /// Matches the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task_created",
            Self::TaskTransitioned { .. } => "task_transitioned",
            Self::TaskAmended { .. } => "task_amended",
            Self::CriticResultRecorded { .. } => "critic_result_recorded",
            Self::DecisionRecorded { .. } => "decision_recorded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::UnboundedReceiver<StoreNotification>,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<StoreNotification>)>,
}

#[derive(Debug, Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.subscribers.push((id, tx));
        Subscription { id, receiver: rx }
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let before = registry.subscribers.len();
        registry.subscribers.retain(|(sub_id, _)| *sub_id != id);
        registry.subscribers.len() != before
    }

    pub fn publish(&self, notification: StoreNotification) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.subscribers.retain(|(id, tx)| {
            let delivered = tx.send(notification.clone()).is_ok();
            if !delivered {
                debug!(subscription = id.0, "pruning closed subscriber");
            }
            delivered
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amended() -> StoreNotification {
        StoreNotification::TaskAmended {
            task_id: Id::from_string("t-1"),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        for passed in [false, true, false] {
            bus.publish(StoreNotification::CriticResultRecorded {
                critic: "build".to_string(),
                passed,
                origin: "runtime".to_string(),
            });
        }

        for sub in [&mut first, &mut second] {
            let mut seen = Vec::new();
            for _ in 0..3 {
                match sub.receiver.recv().await.unwrap() {
                    StoreNotification::CriticResultRecorded { passed, .. } => seen.push(passed),
                    other => panic!("unexpected notification: {other:?}"),
                }
            }
            assert_eq!(seen, vec![false, true, false]);
        }
    }

    #[test]
    fn unsubscribe_removes_subscriber() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(sub.id));
        assert!(!bus.unsubscribe(sub.id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn closed_receivers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        bus.publish(amended());
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }
}
