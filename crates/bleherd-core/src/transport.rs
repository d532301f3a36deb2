//! The boundary to the radio.
//!
//! The state machines never talk to a Bluetooth stack directly. They issue
//! requests through [`Transport`] and receive completions through the
//! [`EventSink`] registered for each device, so the same code runs against
//! [`BtleTransport`](crate::ble::BtleTransport) and
//! [`MockTransport`](crate::mock::MockTransport).

use std::sync::Arc;

use async_trait::async_trait;

use bleherd_types::{AddressKind, Advertisement, HandleRange};

use crate::error::Result;

/// A notification subscription request over a contiguous handle range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyRange {
    /// Subscribe (`true`) or unsubscribe (`false`).
    pub enable: bool,
    /// First handle in the range.
    pub start: u16,
    /// Last handle in the range.
    pub end: u16,
    /// Request indications rather than plain notifications.
    pub indicate: bool,
    /// Acknowledge each indication at the application level.
    pub ack: bool,
}

impl NotifyRange {
    /// Telemetry subscription: enabled, indicated, no application ack.
    pub const fn subscribe(range: HandleRange) -> Self {
        Self {
            enable: true,
            start: range.start,
            end: range.end,
            indicate: true,
            ack: false,
        }
    }

    /// Check whether a handle falls within this range.
    pub const fn contains(&self, handle: u16) -> bool {
        handle >= self.start && handle <= self.end
    }
}

/// Per-device completion callbacks.
///
/// Implementations must be cheap and must not block: they are called from
/// the transport's own tasks.
pub trait EventSink: Send + Sync {
    /// The link is up.
    fn on_connected(&self);

    /// The link is down, or a connect attempt failed.
    fn on_disconnected(&self);

    /// An attribute value was pushed by the peripheral.
    fn on_notification(&self, attribute: u16, data: &[u8]);
}

/// Receives advertisement sightings from the scanner.
pub trait DiscoverySink: Send + Sync {
    /// A peripheral advertised.
    fn on_advertisement(&self, advertisement: Advertisement);
}

/// Asynchronous access to the radio.
///
/// `connect` only initiates: completion arrives later through
/// [`EventSink::on_connected`], failure through
/// [`EventSink::on_disconnected`] or not at all.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Initiate a connection.
    async fn connect(&self, address: &str, kind: AddressKind) -> Result<()>;

    /// Tear the link down.
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Change notification subscriptions for a handle range.
    async fn notify(&self, address: &str, range: NotifyRange) -> Result<()>;

    /// Send a raw write payload: opcode, little-endian handle, value.
    async fn send_command(&self, address: &str, payload: &[u8]) -> Result<()>;

    /// Read an attribute value by handle.
    async fn read_attribute(&self, address: &str, handle: u16) -> Result<Vec<u8>>;

    /// Route completions for `address` to `sink`, replacing any previous sink.
    fn register_sink(&self, address: &str, sink: Arc<dyn EventSink>);

    /// Route advertisement sightings to `sink`.
    fn set_discovery_sink(&self, sink: Arc<dyn DiscoverySink>);

    /// Begin reporting advertisements.
    async fn start_scanning(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleherd_types::handles;

    #[test]
    fn test_subscribe_flags() {
        let range = NotifyRange::subscribe(handles::TEMPERATURE_RANGE);
        assert!(range.enable);
        assert!(range.indicate);
        assert!(!range.ack);
        assert_eq!((range.start, range.end), (48, 51));
        assert!(range.contains(handles::TEMPERATURE_HANDLE));
        assert!(!range.contains(handles::MOISTURE_HANDLE));
    }

    #[test]
    fn test_transport_is_object_safe() {
        fn _assert_object_safe(_: &dyn Transport) {}
        fn _assert_sink_object_safe(_: Arc<dyn EventSink>, _: Arc<dyn DiscoverySink>) {}
    }
}
