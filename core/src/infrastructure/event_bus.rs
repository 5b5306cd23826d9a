// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-process pub/sub for `FleetEvent`, fanned out to SSE subscribers and to
//! the Tool Policy → Invocation Service cancellation wiring.
//!
//! Grounded on the teacher's `infrastructure::event_bus::EventBus`: a
//! `tokio::sync::broadcast::Sender` wrapped with typed `publish_*` helpers
//! and filtering receiver wrappers.

use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::events::FleetEvent;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("event bus closed")]
    Closed,
    #[error("receiver lagged by {0} events")]
    Lagged(u64),
}

pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn publish(&self, event: impl Into<FleetEvent>) {
        // Matches the teacher's policy: a publish with no subscribers is not
        // an error, so the send result is intentionally discarded.
        let _ = self.sender.send(event.into());
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            inner: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    inner: broadcast::Receiver<FleetEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<FleetEvent, EventBusError> {
        match self.inner.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(EventBusError::Closed),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(EventBusError::Lagged(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::ServerEvent;
    use chrono::Utc;

    #[tokio::test]
    async fn publish_subscribe_round_trip() {
        let bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();
        bus.publish(ServerEvent::Starting {
            server_id: "codex".to_string(),
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, FleetEvent::Server(ServerEvent::Starting { .. })));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = EventBus::with_default_capacity();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(ServerEvent::Stopped {
            server_id: "codex".to_string(),
            at: Utc::now(),
        });
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
