//! Attribute handles, service UUIDs and command payloads.
//!
//! The plant sensor and locator tags are addressed by ATT handle rather than
//! by characteristic UUID. The UUIDs below are used to classify advertisements
//! and to map handles onto characteristics on stacks that only expose UUIDs.

use uuid::{Uuid, uuid};

// --- Advertised services ---

/// Plant sensor (telemetry) primary service.
pub const PLANT_SENSOR_SERVICE: Uuid = uuid!("39e1fa00-84a8-11e2-afba-0002a5d5c51b");

/// Locator tag vendor service.
pub const LOCATOR_TAG_SERVICE: Uuid = uuid!("cd54cc79-ce6c-4cf4-9747-447e0fbe6295");

/// Standard Immediate Alert service, also advertised by generic locator tags.
pub const IMMEDIATE_ALERT_SERVICE: Uuid = uuid!("00001802-0000-1000-8000-00805f9b34fb");

// --- Plant sensor characteristics ---

/// Light sensor value characteristic.
pub const ILLUMINANCE_CHARACTERISTIC: Uuid = uuid!("39e1fa01-84a8-11e2-afba-0002a5d5c51b");

/// Temperature value characteristic.
pub const TEMPERATURE_CHARACTERISTIC: Uuid = uuid!("39e1fa04-84a8-11e2-afba-0002a5d5c51b");

/// Soil moisture value characteristic.
pub const MOISTURE_CHARACTERISTIC: Uuid = uuid!("39e1fa05-84a8-11e2-afba-0002a5d5c51b");

/// Live measurement mode characteristic.
pub const LIVE_MODE_CHARACTERISTIC: Uuid = uuid!("39e1fa06-84a8-11e2-afba-0002a5d5c51b");

/// Standard Battery Level characteristic.
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

/// Standard Alert Level characteristic (locator tags).
pub const ALERT_LEVEL_CHARACTERISTIC: Uuid = uuid!("00002a06-0000-1000-8000-00805f9b34fb");

// --- Attribute handles ---

/// Illuminance value handle.
pub const ILLUMINANCE_HANDLE: u16 = 37;

/// Temperature value handle.
pub const TEMPERATURE_HANDLE: u16 = 49;

/// Soil moisture value handle.
pub const MOISTURE_HANDLE: u16 = 53;

/// Live mode value handle (target of the streaming commands).
pub const LIVE_MODE_HANDLE: u16 = 0x39;

/// Battery level handle. Read-only, never notified.
pub const BATTERY_HANDLE: u16 = 68;

/// Alert level handle on locator tags (target of the buzz commands).
pub const ALERT_LEVEL_HANDLE: u16 = 0x1b;

/// An inclusive range of attribute handles covering one characteristic
/// (declaration, value and descriptors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleRange {
    /// First handle in the range.
    pub start: u16,
    /// Last handle in the range.
    pub end: u16,
}

impl HandleRange {
    /// Create a new handle range.
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check whether a handle falls within this range.
    pub const fn contains(&self, handle: u16) -> bool {
        handle >= self.start && handle <= self.end
    }
}

/// Handle range of the illuminance characteristic.
pub const ILLUMINANCE_RANGE: HandleRange = HandleRange::new(36, 39);

/// Handle range of the soil moisture characteristic.
pub const MOISTURE_RANGE: HandleRange = HandleRange::new(52, 55);

/// Handle range of the temperature characteristic.
pub const TEMPERATURE_RANGE: HandleRange = HandleRange::new(48, 51);

/// The three telemetry ranges subscribed on every connection.
pub const TELEMETRY_RANGES: [HandleRange; 3] = [ILLUMINANCE_RANGE, MOISTURE_RANGE, TEMPERATURE_RANGE];

// --- Command payloads ---
//
// Commands are raw ATT PDUs: opcode, little-endian handle, value.

/// ATT Write Request opcode.
pub const ATT_WRITE_REQUEST: u8 = 0x12;

/// ATT Write Command opcode (no response).
pub const ATT_WRITE_COMMAND: u8 = 0x52;

/// Turn live streaming on.
pub const ENABLE_LIVE_MODE: [u8; 4] = [ATT_WRITE_REQUEST, 0x39, 0x00, 0x01];

/// Turn live streaming off.
pub const DISABLE_LIVE_MODE: [u8; 4] = [ATT_WRITE_REQUEST, 0x39, 0x00, 0x00];

/// Start the locator buzzer (high alert).
pub const LOCATOR_ACTIVATE: [u8; 4] = [ATT_WRITE_REQUEST, 0x1b, 0x00, 0x02];

/// Stop the locator buzzer.
pub const LOCATOR_DEACTIVATE: [u8; 4] = [ATT_WRITE_REQUEST, 0x1b, 0x00, 0x00];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_handles_inside_their_ranges() {
        assert!(ILLUMINANCE_RANGE.contains(ILLUMINANCE_HANDLE));
        assert!(MOISTURE_RANGE.contains(MOISTURE_HANDLE));
        assert!(TEMPERATURE_RANGE.contains(TEMPERATURE_HANDLE));
        assert!(!TEMPERATURE_RANGE.contains(MOISTURE_HANDLE));
    }

    #[test]
    fn test_commands_target_expected_handles() {
        assert_eq!(
            u16::from_le_bytes([ENABLE_LIVE_MODE[1], ENABLE_LIVE_MODE[2]]),
            LIVE_MODE_HANDLE
        );
        assert_eq!(
            u16::from_le_bytes([LOCATOR_ACTIVATE[1], LOCATOR_ACTIVATE[2]]),
            ALERT_LEVEL_HANDLE
        );
        assert_ne!(ENABLE_LIVE_MODE, DISABLE_LIVE_MODE);
    }
}
