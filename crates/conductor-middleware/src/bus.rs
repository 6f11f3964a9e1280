//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  A subscriber that falls behind loses the oldest events
//! (`Lagged`); publishers never wait.
//!
//! # Topics
//!
//! Every [`Event`] is routed by its [`EventKind`] to one of four lanes, and
//! additionally to a firehose channel carrying everything:
//!
//! | Topic | Event kind | Typical traffic |
//! |---|---|---|
//! | [`Topic::Telemetry`] | Telemetry | Sensor samples, fused frames |
//! | [`Topic::Health`] | Health | Mode changes, module status, heartbeats |
//! | [`Topic::Commands`] | Command | Dispatched-command audit trail |
//! | [`Topic::Alerts`] | Error | Faults, emergency stops |

use conductor_types::{Event, EventKind};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    Health,
    Commands,
    Alerts,
}

impl Topic {
    pub fn for_kind(kind: EventKind) -> Self {
        match kind {
            EventKind::Telemetry => Topic::Telemetry,
            EventKind::Health => Topic::Health,
            EventKind::Command => Topic::Commands,
            EventKind::Error => Topic::Alerts,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    firehose: broadcast::Sender<Event>,
    telemetry: broadcast::Sender<Event>,
    health: broadcast::Sender<Event>,
    commands: broadcast::Sender<Event>,
    alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every channel independently.
    pub fn new(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        let (telemetry, _) = broadcast::channel(capacity);
        let (health, _) = broadcast::channel(capacity);
        let (commands, _) = broadcast::channel(capacity);
        let (alerts, _) = broadcast::channel(capacity);
        Self {
            firehose,
            telemetry,
            health,
            commands,
            alerts,
        }
    }

    /// Publish `event` to its topic lane and to the firehose.
    ///
    /// Returns the number of receivers that were handed the event.  `0` means
    /// nobody is listening, which is a normal condition, not an error.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_kind(event.kind);
        let on_firehose = self.firehose.send(event.clone()).unwrap_or(0);
        on_firehose + self.topic_sender(topic).send(event).unwrap_or(0)
    }

    /// Subscribe to one [`Topic`] lane.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            label: topic_label(Some(topic)),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of kind.
    pub fn subscribe_all(&self) -> TopicReceiver {
        TopicReceiver {
            label: topic_label(None),
            receiver: self.firehose.subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Telemetry => &self.telemetry,
            Topic::Health => &self.health,
            Topic::Commands => &self.commands,
            Topic::Alerts => &self.alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn topic_label(topic: Option<Topic>) -> &'static str {
    match topic {
        Some(Topic::Telemetry) => "telemetry",
        Some(Topic::Health) => "health",
        Some(Topic::Commands) => "commands",
        Some(Topic::Alerts) => "alerts",
        None => "firehose",
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to one lane (or the firehose).
pub struct TopicReceiver {
    label: &'static str,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// * `Err(RecvError::Lagged(n))` – `n` events were dropped for this
    ///   subscriber; the caller decides whether to continue.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, logging and skipping over lag.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = self.label, lagged_by = n, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{Command, EventPayload, RobotMode, ModeEvent};

    fn heartbeat() -> Event {
        Event::new("motion", EventPayload::Heartbeat)
    }

    fn mode_change() -> Event {
        Event::new(
            "conductor::state",
            EventPayload::ModeChanged {
                from: RobotMode::Active,
                to: RobotMode::Emergency,
                trigger: ModeEvent::EmergencyStop,
                reason: "operator".into(),
            },
        )
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_zero() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(heartbeat()), 0);
    }

    #[tokio::test]
    async fn events_route_to_their_lane() {
        let bus = EventBus::new(16);
        let mut health = bus.subscribe_to(Topic::Health);
        let mut commands = bus.subscribe_to(Topic::Commands);

        bus.publish(Event::new(
            "motion",
            EventPayload::Command(Command::new("walk")),
        ));
        bus.publish(mode_change());

        let cmd = commands.recv().await.unwrap();
        assert_eq!(cmd.kind, EventKind::Command);
        let h = health.recv().await.unwrap();
        assert!(matches!(h.payload, EventPayload::ModeChanged { .. }));
        assert!(health.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn firehose_sees_every_kind() {
        let bus = EventBus::new(16);
        let mut all = bus.subscribe_all();
        bus.publish(heartbeat());
        bus.publish(Event::new(
            "audio",
            EventPayload::Fault {
                code: 1,
                message: "underrun".into(),
                fatal: false,
            },
        ));
        assert_eq!(all.recv().await.unwrap().kind, EventKind::Health);
        assert_eq!(all.recv().await.unwrap().kind, EventKind::Error);
    }

    #[tokio::test]
    async fn publish_counts_lane_and_firehose_receivers() {
        let bus = EventBus::new(16);
        let _lane = bus.subscribe_to(Topic::Health);
        let _all = bus.subscribe_all();
        assert_eq!(bus.publish(heartbeat()), 2);
        assert_eq!(bus.subscriber_count(Topic::Health), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe_to(Topic::Health);
        for _ in 0..5 {
            bus.publish(heartbeat());
        }
        // The two newest survive.
        assert!(rx.next_event().await.is_some());
        assert!(rx.next_event().await.is_some());
        assert!(rx.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_bus_ends_stream() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe_to(Topic::Alerts);
        drop(bus);
        assert!(rx.next_event().await.is_none());
    }

    #[tokio::test]
    async fn clones_share_channels() {
        let bus = EventBus::new(4);
        let clone = bus.clone();
        let mut rx = bus.subscribe_to(Topic::Health);
        clone.publish(heartbeat());
        assert_eq!(rx.recv().await.unwrap().source_module_id, "motion");
    }
}
