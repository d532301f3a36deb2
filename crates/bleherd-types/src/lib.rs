//! Platform-agnostic types for BLE plant sensors and locator tags.
//!
//! This crate holds the data model shared by the core state machines and
//! any host integration:
//!
//! - Peripheral identities, address kinds and roles
//! - Quantity kinds with their calibration domains
//! - Attribute handles, service UUIDs and command payloads
//! - Little-endian payload decoding
//!
//! # Example
//!
//! ```
//! use bleherd_types::{Advertisement, AddressKind, DeviceRole, handles};
//!
//! let adv = Advertisement::new("AA:BB:CC:DD:EE:FF", AddressKind::Random)
//!     .with_service(handles::PLANT_SENSOR_SERVICE);
//! assert_eq!(adv.role(), Some(DeviceRole::TelemetrySensor));
//! ```

pub mod error;
pub mod handles;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use handles::HandleRange;
pub use types::{
    AddressKind, Advertisement, DeviceRole, LocatorState, PeripheralIdentity, QuantityKind,
    SensorReading, decode_u16_le,
};
