//! VM lifecycle notifications
//!
//! Host connections announce power state changes and removals, the
//! service announces batch deployment outcomes. Listeners subscribe by
//! name to the event kinds they handle and are called in subscription
//! order.

use std::sync::Arc;

use async_trait::async_trait;
use labvisor_shared_types::{EventKind, HypervisorEvent};
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::RwLock;

pub type EventBusResult<T> = Result<T, EventBusError>;

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &HypervisorEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("listener '{0}' is already subscribed")]
    Duplicate(String),
    #[error("listener '{0}' is not subscribed")]
    Unknown(String),
    #[error("{kind} event rejected by {}", .listeners.join(", "))]
    Rejected {
        kind: EventKind,
        listeners: Vec<String>,
    },
}

struct Subscription {
    name: String,
    /// Empty means every kind
    kinds: Vec<EventKind>,
    listener: Arc<dyn EventListener>,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `kinds`; an empty slice subscribes it to
    /// every event.
    pub async fn subscribe<L>(
        &self,
        name: impl Into<String>,
        kinds: &[EventKind],
        listener: L,
    ) -> EventBusResult<()>
    where
        L: EventListener + 'static,
    {
        let name = name.into();
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.iter().any(|s| s.name == name) {
            return Err(EventBusError::Duplicate(name));
        }

        debug!("{} subscribed to {:?}", name, kinds);
        subscriptions.push(Subscription {
            name,
            kinds: kinds.to_vec(),
            listener: Arc::new(listener),
        });
        Ok(())
    }

    pub async fn unsubscribe(&self, name: &str) -> EventBusResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.name != name);
        if subscriptions.len() == before {
            return Err(EventBusError::Unknown(name.to_string()));
        }
        Ok(())
    }

    /// Subscriber names in delivery order.
    pub async fn subscribers(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .await
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Deliver `event` to every interested listener, even after one of
    /// them failed. Returns how many listeners accepted it.
    pub async fn publish(&self, event: HypervisorEvent) -> EventBusResult<usize> {
        let kind = event.kind();
        let targets: Vec<(String, Arc<dyn EventListener>)> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.wants(kind))
            .map(|s| (s.name.clone(), Arc::clone(&s.listener)))
            .collect();

        let mut accepted = 0;
        let mut rejected = Vec::new();
        for (name, listener) in targets {
            match listener.on_event(&event).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!("{} did not handle {} event: {}", name, kind, e);
                    rejected.push(name);
                }
            }
        }

        if rejected.is_empty() {
            Ok(accepted)
        } else {
            Err(EventBusError::Rejected {
                kind,
                listeners: rejected,
            })
        }
    }

    /// Publish for callers that must not fail on a listener error.
    pub async fn notify(&self, event: HypervisorEvent) {
        if let Err(e) = self.publish(event).await {
            debug!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvisor_shared_types::VmState;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Journal {
        lines: Arc<Mutex<Vec<String>>>,
    }

    struct Writer {
        name: &'static str,
        journal: Journal,
        fail: bool,
    }

    #[async_trait]
    impl EventListener for Writer {
        async fn on_event(&self, event: &HypervisorEvent) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("console hub offline");
            }
            self.journal
                .lines
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.kind()));
            Ok(())
        }
    }

    fn writer(name: &'static str, journal: &Journal) -> Writer {
        Writer {
            name,
            journal: journal.clone(),
            fail: false,
        }
    }

    fn started() -> HypervisorEvent {
        HypervisorEvent::VmStateChanged {
            id: "vm-1".to_string(),
            name: "db#abc".to_string(),
            host: "esx1".to_string(),
            state: VmState::Running,
        }
    }

    fn removed() -> HypervisorEvent {
        HypervisorEvent::VmRemoved {
            id: "vm-1".to_string(),
            name: "db#abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_delivery_follows_kinds_and_order() {
        let bus = EventBus::new();
        let journal = Journal::default();
        bus.subscribe("audit", &[], writer("audit", &journal))
            .await
            .unwrap();
        bus.subscribe("console", &[EventKind::VmState], writer("console", &journal))
            .await
            .unwrap();

        assert_eq!(bus.publish(started()).await.unwrap(), 2);
        assert_eq!(bus.publish(removed()).await.unwrap(), 1);

        assert_eq!(
            *journal.lines.lock().unwrap(),
            vec!["audit:vm_state", "console:vm_state", "audit:vm_removed"]
        );
        assert_eq!(bus.subscribers().await, vec!["audit", "console"]);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_names() {
        let bus = EventBus::new();
        let journal = Journal::default();
        bus.subscribe("audit", &[], writer("audit", &journal))
            .await
            .unwrap();

        let again = bus.subscribe("audit", &[], writer("audit", &journal)).await;
        assert!(matches!(again, Err(EventBusError::Duplicate(_))));

        bus.unsubscribe("audit").await.unwrap();
        assert!(matches!(
            bus.unsubscribe("audit").await,
            Err(EventBusError::Unknown(_))
        ));
        assert!(bus.subscribers().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejecting_listener_does_not_stop_delivery() {
        let bus = EventBus::new();
        let journal = Journal::default();
        bus.subscribe(
            "hub",
            &[],
            Writer {
                name: "hub",
                journal: journal.clone(),
                fail: true,
            },
        )
        .await
        .unwrap();
        bus.subscribe("audit", &[], writer("audit", &journal))
            .await
            .unwrap();

        let err = bus.publish(removed()).await.unwrap_err();
        assert_eq!(err.to_string(), "vm_removed event rejected by hub");
        assert_eq!(journal.lines.lock().unwrap().len(), 1);

        bus.notify(removed()).await;
        assert_eq!(journal.lines.lock().unwrap().len(), 2);
    }
}
