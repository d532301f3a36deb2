//! Notification decoding and publication.

use std::sync::Arc;

use tracing::{debug, info, warn};

use bleherd_types::{PeripheralIdentity, QuantityKind, SensorReading, decode_u16_le, handles};

use crate::calibration::CalibrationSet;
use crate::error::Result;
use crate::events::Publisher;
use crate::session::NotificationReceiver;
use crate::transport::Transport;

/// Turns raw attribute payloads into calibrated, published readings.
#[derive(Clone)]
pub struct NotificationRouter {
    calibration: Arc<CalibrationSet>,
    publisher: Arc<dyn Publisher>,
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter").finish_non_exhaustive()
    }
}

impl NotificationRouter {
    /// Create a router.
    pub fn new(calibration: Arc<CalibrationSet>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            calibration,
            publisher,
        }
    }

    /// Decode, calibrate and publish one payload.
    ///
    /// Unknown handles and short payloads are logged and dropped.
    pub fn route(
        &self,
        device: &PeripheralIdentity,
        attribute: u16,
        data: &[u8],
    ) -> Option<SensorReading> {
        let Some(kind) = QuantityKind::from_handle(attribute) else {
            info!(
                "{}: ignoring notification on unknown handle 0x{:04x}",
                device.address, attribute
            );
            return None;
        };

        let reading = match self.decode(kind, data) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("{}: dropping {} notification: {}", device.address, kind, e);
                return None;
            }
        };

        debug!(
            "{}: {} raw={} key={} value={}",
            device.address, kind, reading.raw, reading.key, reading.value
        );
        self.publisher.publish_reading(device, &reading);
        Some(reading)
    }

    fn decode(&self, kind: QuantityKind, data: &[u8]) -> Result<SensorReading> {
        let raw = decode_u16_le(data)?;
        Ok(SensorReading {
            kind,
            raw_bytes: data.to_vec(),
            raw,
            key: kind.lookup_key(raw),
            value: self.calibration.calibrate(kind, raw),
        })
    }

    /// Consume a device's notifications until the channel closes.
    ///
    /// There is exactly one consumer per device, so readings are published in
    /// arrival order.
    pub async fn run(&self, device: PeripheralIdentity, mut notifications: NotificationReceiver) {
        while let Some(notification) = notifications.recv().await {
            self.route(&device, notification.attribute, &notification.data);
        }
        debug!("{}: notification channel closed", device.address);
    }

    /// Read one quantity on demand.
    pub async fn read_quantity(
        &self,
        transport: &dyn Transport,
        device: &PeripheralIdentity,
        kind: QuantityKind,
    ) -> Result<SensorReading> {
        let data = transport.read_attribute(&device.address, kind.handle()).await?;
        let reading = self.decode(kind, &data)?;
        self.publisher.publish_reading(device, &reading);
        Ok(reading)
    }

    /// Read the battery level. Returned as-is, without calibration.
    pub async fn read_battery(
        &self,
        transport: &dyn Transport,
        device: &PeripheralIdentity,
    ) -> Result<u16> {
        let data = transport
            .read_attribute(&device.address, handles::BATTERY_HANDLE)
            .await?;
        let level = decode_u16_le(&data)?;
        info!("{}: battery level {}", device.address, level);
        self.publisher.publish_battery(device, level);
        Ok(level)
    }
}
