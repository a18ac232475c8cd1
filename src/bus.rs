//! In-process fan-out of negotiation events.
//!
//! The service publishes here after every committed transition. Delivery
//! collaborators (push, email, ...) subscribe for [`NegotiationEvent::Notified`];
//! the expiry scheduler subscribes for [`NegotiationEvent::Transitioned`]
//! to arm and disarm timers.
use super::appointment::AppointmentStatus;
use super::clock::TimeStamp;
use super::notification::Notification;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    Transitioned {
        appointment_id: String,
        status: AppointmentStatus,
        /// Deadline now in force; `None` once nothing is pending.
        expires_at: Option<TimeStamp>,
    },
    Notified(Notification),
}

const DEFAULT_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<NegotiationEvent>,
}

impl EventBus {
    /// Slow receivers past `capacity` observe `RecvError::Lagged` and lose
    /// the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: NegotiationEvent) {
        // only fails when nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NegotiationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let event = NegotiationEvent::Transitioned {
            appointment_id: "appt_1".into(),
            status: AppointmentStatus::Approved,
            expires_at: None,
        };
        bus.publish(event.clone());

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(NegotiationEvent::Transitioned {
            appointment_id: "appt_2".into(),
            status: AppointmentStatus::Pending,
            expires_at: None,
        });
    }
}
