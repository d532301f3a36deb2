//! Publication of decoded values and lifecycle events.
//!
//! The state machines publish through the [`Publisher`] trait. The provided
//! implementation, [`EventDispatcher`], fans events out over a tokio
//! broadcast channel as serializable [`DeviceEvent`]s.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use bleherd_types::{Advertisement, LocatorState, PeripheralIdentity, SensorReading};

use crate::session::LinkState;

/// Events that can be emitted by the driver.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// A peripheral with a known role was seen for the first time.
    Discovered {
        device: PeripheralIdentity,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// The link state of a session changed.
    LinkStateChanged {
        device: PeripheralIdentity,
        state: LinkState,
    },
    /// A calibrated sensor value.
    Reading {
        device: PeripheralIdentity,
        reading: SensorReading,
        #[serde(with = "time::serde::rfc3339")]
        captured_at: OffsetDateTime,
    },
    /// A battery level read on demand.
    BatteryLevel { device: PeripheralIdentity, level: u16 },
    /// A locator buzz started or stopped.
    LocatorState {
        device: PeripheralIdentity,
        state: LocatorState,
    },
}

impl DeviceEvent {
    /// The device this event concerns.
    pub fn device(&self) -> &PeripheralIdentity {
        match self {
            DeviceEvent::Discovered { device, .. }
            | DeviceEvent::LinkStateChanged { device, .. }
            | DeviceEvent::Reading { device, .. }
            | DeviceEvent::BatteryLevel { device, .. }
            | DeviceEvent::LocatorState { device, .. } => device,
        }
    }
}

/// Sink for everything the driver wants the outside world to know.
///
/// Only readings and locator state are required; the rest default to no-ops.
pub trait Publisher: Send + Sync {
    /// A calibrated reading.
    fn publish_reading(&self, device: &PeripheralIdentity, reading: &SensorReading);

    /// A locator buzz started or stopped.
    fn publish_locator_state(&self, device: &PeripheralIdentity, state: LocatorState);

    /// A new peripheral is being tracked.
    fn publish_discovered(&self, _device: &PeripheralIdentity, _advertisement: &Advertisement) {}

    /// A session changed link state.
    fn publish_link_state(&self, _device: &PeripheralIdentity, _state: LinkState) {}

    /// A battery level was read.
    fn publish_battery(&self, _device: &PeripheralIdentity, _level: u16) {}
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DeviceEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Publisher for EventDispatcher {
    fn publish_reading(&self, device: &PeripheralIdentity, reading: &SensorReading) {
        self.send(DeviceEvent::Reading {
            device: device.clone(),
            reading: reading.clone(),
            captured_at: OffsetDateTime::now_utc(),
        });
    }

    fn publish_locator_state(&self, device: &PeripheralIdentity, state: LocatorState) {
        self.send(DeviceEvent::LocatorState {
            device: device.clone(),
            state,
        });
    }

    fn publish_discovered(&self, device: &PeripheralIdentity, advertisement: &Advertisement) {
        self.send(DeviceEvent::Discovered {
            device: device.clone(),
            name: advertisement.local_name.clone(),
            rssi: advertisement.rssi,
        });
    }

    fn publish_link_state(&self, device: &PeripheralIdentity, state: LinkState) {
        self.send(DeviceEvent::LinkStateChanged {
            device: device.clone(),
            state,
        });
    }

    fn publish_battery(&self, device: &PeripheralIdentity, level: u16) {
        self.send(DeviceEvent::BatteryLevel {
            device: device.clone(),
            level,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleherd_types::{AddressKind, DeviceRole, QuantityKind};

    fn sensor() -> PeripheralIdentity {
        PeripheralIdentity::new(
            "AA:BB:CC:DD:EE:FF",
            AddressKind::Public,
            DeviceRole::TelemetrySensor,
        )
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_readings() {
        let dispatcher = EventDispatcher::default();
        let mut rx = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 1);

        let reading = SensorReading {
            kind: QuantityKind::Temperature,
            raw_bytes: vec![0xBC, 0x02],
            raw: 700,
            key: 700,
            value: 21.5,
        };
        dispatcher.publish_reading(&sensor(), &reading);

        match rx.recv().await.unwrap() {
            DeviceEvent::Reading {
                device, reading: r, ..
            } => {
                assert_eq!(device, sensor());
                assert_eq!(r, reading);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_send_without_receivers_is_ignored() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.publish_battery(&sensor(), 87);
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = DeviceEvent::LinkStateChanged {
            device: sensor(),
            state: LinkState::Connected,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"link_state_changed\""));
        assert!(json.contains("\"state\":\"connected\""));

        let parsed: DeviceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.device().address, "AA:BB:CC:DD:EE:FF");
    }
}
