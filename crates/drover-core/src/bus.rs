// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Topic-based pub/sub for runtime lifecycle events.
//!
//! Subscribers register on a session id or on [`Topic::All`]; the runtime
//! publishes one envelope per event.  Delivery is best-effort and never
//! blocks the publisher: each subscriber gets a bounded broadcast mailbox,
//! and a subscriber that falls behind loses its oldest events (it observes
//! a `Lagged` error rather than stalling the state machine).

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::{AgentEvent, Envelope};

/// Subscription scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Events of one session only.
    Session(String),
    /// Every session published through this bus.
    All,
}

/// Concurrent topic registry.  Cheap to share behind an `Arc`.
pub struct EventBus {
    topics: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    all: broadcast::Sender<Envelope>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        Self {
            topics: RwLock::new(HashMap::new()),
            all,
            capacity,
        }
    }

    /// Subscribe to a topic.  Unsubscribing is dropping the receiver.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Envelope> {
        match topic {
            Topic::All => self.all.subscribe(),
            Topic::Session(id) => {
                let mut topics = self.topics.write().unwrap();
                topics
                    .entry(id)
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .subscribe()
            }
        }
    }

    /// Publish an event to the session's subscribers and all-subscribers.
    ///
    /// No subscribers is fine — the send result is ignored.  A topic whose
    /// last receiver is gone is pruned here so long-lived buses do not
    /// accumulate dead sessions.
    pub fn publish(&self, session_id: &str, event: AgentEvent) {
        let envelope = Envelope {
            session_id: session_id.to_string(),
            event,
        };

        let topic_is_dead = {
            let topics = self.topics.read().unwrap();
            match topics.get(session_id) {
                Some(tx) if tx.receiver_count() > 0 => {
                    let _ = tx.send(envelope.clone());
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if topic_is_dead {
            self.topics.write().unwrap().remove(session_id);
        }

        let _ = self.all.send(envelope);
    }

    /// Number of live subscribers across the session topic and `all`.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let topic = self
            .topics
            .read()
            .unwrap()
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0);
        topic + self.all.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        // Events are small; a deep mailbox absorbs bursts from fast streams.
        Self::new(1024)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_subscriber_receives_session_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(Topic::Session("s1".into()));
        bus.publish("s1", AgentEvent::AgentStart);
        let env = rx.recv().await.unwrap();
        assert_eq!(env.session_id, "s1");
        assert!(matches!(env.event, AgentEvent::AgentStart));
    }

    #[tokio::test]
    async fn session_subscriber_does_not_see_other_sessions() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(Topic::Session("s1".into()));
        bus.publish("s2", AgentEvent::AgentStart);
        bus.publish("s1", AgentEvent::AgentEnd);
        let env = rx.recv().await.unwrap();
        assert!(matches!(env.event, AgentEvent::AgentEnd));
    }

    #[tokio::test]
    async fn all_subscriber_sees_every_session() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(Topic::All);
        bus.publish("a", AgentEvent::AgentStart);
        bus.publish("b", AgentEvent::AgentEnd);
        assert_eq!(rx.recv().await.unwrap().session_id, "a");
        assert_eq!(rx.recv().await.unwrap().session_id, "b");
    }

    #[test]
    fn publish_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::default();
        bus.publish("nobody-listening", AgentEvent::AgentStart);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_not_publisher() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe(Topic::Session("s1".into()));
        for i in 0..32 {
            bus.publish("s1", AgentEvent::MessageDelta(format!("{i}")));
        }
        // The first recv reports the lag; subsequent events are the newest.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected Lagged, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn dropping_receiver_unsubscribes() {
        let bus = EventBus::default();
        let rx = bus.subscribe(Topic::Session("s1".into()));
        assert_eq!(bus.subscriber_count("s1"), 1);
        drop(rx);
        // The publish after the drop prunes the dead topic.
        bus.publish("s1", AgentEvent::AgentStart);
        assert_eq!(bus.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn two_subscribers_both_receive() {
        let bus = EventBus::default();
        let mut a = bus.subscribe(Topic::Session("s1".into()));
        let mut b = bus.subscribe(Topic::Session("s1".into()));
        bus.publish("s1", AgentEvent::AgentStart);
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
