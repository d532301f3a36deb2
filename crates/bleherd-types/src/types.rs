//! Core types for peripherals and sensor data.

use core::fmt;

use bytes::Buf;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};
use crate::handles;

/// Kind of Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AddressKind {
    /// IEEE-assigned public address.
    Public,
    /// Random (static or private) address.
    Random,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Public => write!(f, "public"),
            AddressKind::Random => write!(f, "random"),
        }
    }
}

/// What a tracked peripheral is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceRole {
    /// Duty-cycled plant sensor pushing illuminance, moisture and temperature.
    TelemetrySensor,
    /// Locator tag whose only actuation is a short buzz.
    LocatorTag,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::TelemetrySensor => write!(f, "telemetry sensor"),
            DeviceRole::LocatorTag => write!(f, "locator tag"),
        }
    }
}

/// Immutable identity of a tracked peripheral.
///
/// Created on the first advertisement sighting. The address is the dedup key
/// for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeripheralIdentity {
    /// Hardware address, e.g. `AA:BB:CC:DD:EE:FF`.
    pub address: String,
    /// Whether the address is public or random.
    pub address_kind: AddressKind,
    /// Role tag.
    pub role: DeviceRole,
}

impl PeripheralIdentity {
    /// Create a new identity.
    pub fn new(address: impl Into<String>, address_kind: AddressKind, role: DeviceRole) -> Self {
        Self {
            address: address.into(),
            address_kind,
            role,
        }
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.address, self.role, self.address_kind)
    }
}

/// A physical quantity measured by the plant sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum QuantityKind {
    /// Sunlight.
    Illuminance,
    /// Volumetric soil moisture.
    SoilMoisture,
    /// Temperature.
    Temperature,
}

impl QuantityKind {
    /// All quantity kinds, in table loading order.
    pub const ALL: [QuantityKind; 3] = [
        QuantityKind::Illuminance,
        QuantityKind::SoilMoisture,
        QuantityKind::Temperature,
    ];

    /// Inclusive `(min, max)` bounds of the raw domain accepted by the table.
    ///
    /// # Examples
    ///
    /// ```
    /// use bleherd_types::QuantityKind;
    ///
    /// assert_eq!(QuantityKind::SoilMoisture.domain(), (210, 700));
    /// assert_eq!(QuantityKind::Temperature.domain(), (210, 1372));
    /// ```
    #[must_use]
    pub const fn domain(&self) -> (u16, u16) {
        match self {
            QuantityKind::Illuminance => (0, 65530),
            QuantityKind::SoilMoisture => (210, 700),
            QuantityKind::Temperature => (210, 1372),
        }
    }

    /// Table sampling step. Only illuminance is sampled sparsely.
    #[must_use]
    pub const fn key_step(&self) -> u16 {
        match self {
            QuantityKind::Illuminance => 10,
            _ => 1,
        }
    }

    /// Clamp a raw reading into the domain and round it down onto the table grid.
    ///
    /// # Examples
    ///
    /// ```
    /// use bleherd_types::QuantityKind;
    ///
    /// assert_eq!(QuantityKind::SoilMoisture.lookup_key(50), 210);
    /// assert_eq!(QuantityKind::Temperature.lookup_key(5000), 1372);
    /// assert_eq!(QuantityKind::Illuminance.lookup_key(123), 120);
    /// assert_eq!(QuantityKind::Illuminance.lookup_key(u16::MAX), 65530);
    /// ```
    #[must_use]
    pub fn lookup_key(&self, raw: u16) -> u16 {
        let (min, max) = self.domain();
        let clamped = raw.clamp(min, max);
        let step = self.key_step();
        clamped - clamped % step
    }

    /// Map a notified attribute handle to the quantity it carries.
    #[must_use]
    pub fn from_handle(handle: u16) -> Option<Self> {
        match handle {
            handles::ILLUMINANCE_HANDLE => Some(QuantityKind::Illuminance),
            handles::TEMPERATURE_HANDLE => Some(QuantityKind::Temperature),
            handles::MOISTURE_HANDLE => Some(QuantityKind::SoilMoisture),
            _ => None,
        }
    }

    /// Value handle carrying this quantity.
    #[must_use]
    pub const fn handle(&self) -> u16 {
        match self {
            QuantityKind::Illuminance => handles::ILLUMINANCE_HANDLE,
            QuantityKind::SoilMoisture => handles::MOISTURE_HANDLE,
            QuantityKind::Temperature => handles::TEMPERATURE_HANDLE,
        }
    }

    /// Short machine-friendly name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            QuantityKind::Illuminance => "illuminance",
            QuantityKind::SoilMoisture => "moisture",
            QuantityKind::Temperature => "temperature",
        }
    }
}

impl fmt::Display for QuantityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded and calibrated sensor value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorReading {
    /// Quantity this reading measures.
    pub kind: QuantityKind,
    /// Payload as received.
    pub raw_bytes: Vec<u8>,
    /// Little-endian integer decoded from the payload.
    pub raw: u16,
    /// Clamped (and for illuminance, floored) table key.
    pub key: u16,
    /// Calibrated physical value.
    pub value: f64,
}

/// Progress of a locator buzz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LocatorState {
    /// The buzzer is on.
    Started,
    /// The buzzer is off again.
    Stopped,
}

/// A single advertisement sighting reported by the radio.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Advertisement {
    /// Hardware address.
    pub address: String,
    /// Address kind.
    pub address_kind: AddressKind,
    /// Advertised local name, if any.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Signal strength.
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Create an advertisement with no name, services or RSSI.
    pub fn new(address: impl Into<String>, address_kind: AddressKind) -> Self {
        Self {
            address: address.into(),
            address_kind,
            local_name: None,
            services: Vec::new(),
            rssi: None,
        }
    }

    /// Add an advertised service UUID.
    #[must_use]
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Classify the advertiser by the services it announces.
    #[must_use]
    pub fn role(&self) -> Option<DeviceRole> {
        if self.services.contains(&handles::PLANT_SENSOR_SERVICE) {
            Some(DeviceRole::TelemetrySensor)
        } else if self.services.iter().any(|s| {
            *s == handles::LOCATOR_TAG_SERVICE || *s == handles::IMMEDIATE_ALERT_SERVICE
        }) {
            Some(DeviceRole::LocatorTag)
        } else {
            None
        }
    }

    /// Build the identity for this advertiser, if it has a known role.
    #[must_use]
    pub fn identity(&self) -> Option<PeripheralIdentity> {
        self.role()
            .map(|role| PeripheralIdentity::new(self.address.clone(), self.address_kind, role))
    }
}

/// Decode the leading little-endian `u16` of an attribute payload.
///
/// Trailing bytes are ignored.
///
/// # Examples
///
/// ```
/// use bleherd_types::decode_u16_le;
///
/// assert_eq!(decode_u16_le(&[0xBC, 0x02]).unwrap(), 700);
/// assert!(decode_u16_le(&[0x01]).is_err());
/// ```
pub fn decode_u16_le(data: &[u8]) -> ParseResult<u16> {
    if data.len() < 2 {
        return Err(ParseError::InsufficientBytes {
            expected: 2,
            actual: data.len(),
        });
    }
    let mut buf = data;
    Ok(buf.get_u16_le())
}
