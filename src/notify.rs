use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for live feeds. Topics are session ids (reception
/// dashboards watching bookings arrive) or patient ids (chart updates).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, topic: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&topic) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a session is deleted).
    #[allow(dead_code)]
    pub fn remove(&self, topic: &Ulid) {
        self.channels.remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let session = Ulid::new();
        let mut rx = hub.subscribe(session);

        let event = Event::BookingAccepted {
            id: Ulid::new(),
            session_id: session,
            patient_id: Ulid::new(),
            serial: 1,
            accepted_at: 100,
        };
        hub.send(session, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let session = Ulid::new();
        // No subscriber — should not panic
        hub.send(
            session,
            &Event::SessionCreated {
                id: session,
                doctor_id: Ulid::new(),
                span: Span::new(0, 1000),
                capacity: 1,
            },
        );
    }
}
