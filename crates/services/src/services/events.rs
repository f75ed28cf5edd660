//! Lifecycle and output event broadcasting.
//!
//! Fire-and-forget multicast over a tokio broadcast channel: publishing never
//! blocks, every subscriber gets every event independently, and a slow
//! subscriber only loses its own lagged messages.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Connected,
    CommandStarted,
    CommandOutput,
    CommandFinished,
    CommandError,
    CommandCancelled,
    ContainerCreated,
    PullingImage,
    ImagePulled,
    ContainerCleaned,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub struct EventSubscription {
    pub session_id: Uuid,
    pub receiver: broadcast::Receiver<SandboxEvent>,
}

#[derive(Clone)]
pub struct EventService {
    tx: broadcast::Sender<SandboxEvent>,
    sessions: std::sync::Arc<DashMap<Uuid, DateTime<Utc>>>,
}

impl Default for EventService {
    fn default() -> Self {
        Self::new()
    }
}

impl EventService {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            sessions: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Publish to whoever is listening right now. A send error only means
    /// there are no subscribers, which is fine.
    pub fn publish(&self, kind: EventKind, data: serde_json::Value) {
        let event = SandboxEvent {
            kind,
            data,
            timestamp: Utc::now(),
        };
        let _ = self.tx.send(event);
    }

    /// Register a new subscriber session. The caller frames the returned
    /// receiver's events however it likes (the web layer uses SSE).
    pub fn subscribe(&self) -> EventSubscription {
        let session_id = Uuid::new_v4();
        self.sessions.insert(session_id, Utc::now());
        EventSubscription {
            session_id,
            receiver: self.tx.subscribe(),
        }
    }

    /// Drop a session from the registry. Returns false for unknown ids.
    pub fn unsubscribe(&self, session_id: Uuid) -> bool {
        self.sessions.remove(&session_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_every_event() {
        let events = EventService::new();
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        events.publish(EventKind::ContainerCreated, json!({"tenant": "u1"}));

        let got_a = a.receiver.recv().await.unwrap();
        let got_b = b.receiver.recv().await.unwrap();
        assert_eq!(got_a.kind, EventKind::ContainerCreated);
        assert_eq!(got_b.kind, EventKind::ContainerCreated);
        assert_eq!(got_a.data["tenant"], "u1");
    }

    #[test]
    fn publishing_without_subscribers_does_not_block_or_panic() {
        let events = EventService::new();
        events.publish(EventKind::CommandStarted, json!({}));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let events = EventService::new();
        let sub = events.subscribe();
        assert_eq!(events.session_count(), 1);
        assert!(events.unsubscribe(sub.session_id));
        assert!(!events.unsubscribe(sub.session_id));
        assert_eq!(events.session_count(), 0);
    }

    #[test]
    fn event_kinds_serialize_kebab_case() {
        let event = SandboxEvent {
            kind: EventKind::PullingImage,
            data: json!({"image": "node:20-alpine"}),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "pulling-image");
    }
}
