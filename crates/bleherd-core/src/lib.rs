//! Session supervision for BLE plant sensors and locator tags.
//!
//! This crate runs the state machines that keep a herd of low-power
//! peripherals connected and useful:
//!
//! - **Calibration**: clamp raw readings into their domain and convert them
//!   through lookup tables ([`CalibrationSet`])
//! - **Notification routing**: decode pushed attribute values and publish
//!   calibrated readings ([`NotificationRouter`])
//! - **Duty cycling**: stream telemetry for a short window, then let the
//!   sensor sleep ([`DutyCycleScheduler`])
//! - **Actuation**: buzz a locator tag with bounded connect retries
//!   ([`ActuationProtocol`])
//! - **Supervision**: one control loop per device with passive reconnects
//!   ([`SessionSupervisor`])
//!
//! The radio is reached only through the [`Transport`] trait. [`BtleTransport`]
//! implements it with btleplug; [`MockTransport`] implements it in memory for
//! tests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bleherd_core::{BtleTransport, CalibrationSet, Driver, DriverConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleTransport::new().await?);
//!     let calibration = CalibrationSet::load("light.json", "moisture.json", "temperature.json")?;
//!     let driver = Driver::new(transport, calibration, DriverConfig::default())?;
//!
//!     let mut events = driver.events();
//!     driver.start().await?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod actuation;
pub mod ble;
pub mod calibration;
pub mod clock;
pub mod driver;
pub mod duty_cycle;
pub mod error;
pub mod events;
pub mod mock;
pub mod registry;
pub mod retry;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod transport;

// Re-export types
pub use bleherd_types as types;

pub use actuation::{ActuationConfig, ActuationProtocol, ActuationRequest, ActuationUpdate};
pub use ble::{AttributeMap, BtleTransport};
pub use calibration::{CalibrationSet, CalibrationTable};
pub use clock::{Clock, TokioClock};
pub use driver::{Driver, DriverConfig};
pub use duty_cycle::{CycleExit, DutyCycleScheduler};
pub use error::{ConnectionFailureReason, Error, Result};
pub use events::{DeviceEvent, EventDispatcher, EventReceiver, EventSender, Publisher};
pub use mock::MockTransport;
pub use registry::Registry;
pub use retry::{Backoff, RetryPolicy};
pub use router::NotificationRouter;
pub use session::{ActuationGuard, LinkEvent, LinkState, Notification, RunFlag, Session};
pub use supervisor::SessionSupervisor;
pub use transport::{DiscoverySink, EventSink, NotifyRange, Transport};
