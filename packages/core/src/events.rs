//! In-process event bus for drive lifecycle events.
//!
//! The inventory and the mount orchestrator publish [`DriveEvent`]s; the CLI
//! and any other presentation layer subscribe. Delivery is synchronous and in
//! publish order. Subscribers must not block: forward to a channel
//! ([`ChannelSubscriber`]) if real work is needed.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::logging;
use crate::record::DriveRecord;

/// Kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Removed,
    Mounted,
    Unmounted,
    DirtyVolume,
    MountedReadOnly,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Mounted => "mounted",
            Self::Unmounted => "unmounted",
            Self::DirtyVolume => "dirty_volume",
            Self::MountedReadOnly => "mounted_readonly",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event carrying the record as it was when the event fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "drive", rename_all = "snake_case")]
pub enum DriveEvent {
    Added(DriveRecord),
    Removed(DriveRecord),
    Mounted(DriveRecord),
    Unmounted(DriveRecord),
    DirtyVolume(DriveRecord),
    #[serde(rename = "mounted_readonly")]
    MountedReadOnly(DriveRecord),
}

impl DriveEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Added(_) => EventKind::Added,
            Self::Removed(_) => EventKind::Removed,
            Self::Mounted(_) => EventKind::Mounted,
            Self::Unmounted(_) => EventKind::Unmounted,
            Self::DirtyVolume(_) => EventKind::DirtyVolume,
            Self::MountedReadOnly(_) => EventKind::MountedReadOnly,
        }
    }

    pub fn record(&self) -> &DriveRecord {
        match self {
            Self::Added(r)
            | Self::Removed(r)
            | Self::Mounted(r)
            | Self::Unmounted(r)
            | Self::DirtyVolume(r)
            | Self::MountedReadOnly(r) => r,
        }
    }
}

/// Receives every event published on a bus.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &DriveEvent);
}

/// Logs every event through [`logging::drive_event`].
#[derive(Debug, Default)]
pub struct LoggingSubscriber;

impl EventSubscriber for LoggingSubscriber {
    fn on_event(&self, event: &DriveEvent) {
        logging::drive_event(event.kind(), event.record());
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug)]
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<DriveEvent>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DriveEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSubscriber for ChannelSubscriber {
    fn on_event(&self, event: &DriveEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.sender.send(event.clone());
    }
}

/// Publish/subscribe hub shared by the engine components.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("EventBus").field("subscribers", &count).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with a [`LoggingSubscriber`] already attached.
    pub fn with_logging() -> Self {
        let bus = Self::new();
        bus.subscribe(Arc::new(LoggingSubscriber));
        bus
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    /// Subscribes a fresh channel and returns its receiving end.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<DriveEvent> {
        let (subscriber, receiver) = ChannelSubscriber::new();
        self.subscribe(Arc::new(subscriber));
        receiver
    }

    pub fn publish(&self, event: DriveEvent) {
        // Clone the list so a subscriber may subscribe others without deadlocking.
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EventKind>>);

    impl EventSubscriber for Recorder {
        fn on_event(&self, event: &DriveEvent) {
            self.0.lock().unwrap().push(event.kind());
        }
    }

    #[test]
    fn test_publish_in_order_to_all() {
        let bus = EventBus::with_logging();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        bus.publish(DriveEvent::Removed(DriveRecord::removed("sda")));
        bus.publish(DriveEvent::Added(DriveRecord::removed("sdb")));

        let expected = vec![EventKind::Removed, EventKind::Added];
        assert_eq!(*a.0.lock().unwrap(), expected);
        assert_eq!(*b.0.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_channel_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.channel();
        bus.publish(DriveEvent::DirtyVolume(DriveRecord::removed("sdc1")));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::DirtyVolume);
        assert_eq!(event.record().name, "sdc1");
    }

    #[test]
    fn test_event_json_shape() {
        let event = DriveEvent::MountedReadOnly(DriveRecord::removed("sdc1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "mounted_readonly");
        assert_eq!(json["drive"]["name"], "sdc1");
    }
}
