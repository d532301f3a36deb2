//! Host daemon for BLE plant sensors and locator tags.
//!
//! The `bleherd` binary scans for peripherals, keeps every plant sensor on
//! its sample/sleep duty cycle and prints each event as one JSON line on
//! stdout. Logs go to stderr.
//!
//! # Configuration
//!
//! The daemon reads `~/.config/bleherd/config.toml`:
//!
//! ```toml
//! [calibration]
//! illuminance = "/var/lib/bleherd/light.json"
//! moisture = "/var/lib/bleherd/moisture.json"
//! temperature = "/var/lib/bleherd/temperature.json"
//!
//! [timing]
//! sample_window_secs = 5
//! sleep_window_secs = 1800
//! reconnect_delay_secs = 5
//! connect_timeout_secs = 10
//! activation_secs = 5
//! actuation_attempts = 3
//! actuation_backoff_secs = 2
//! ```
//!
//! Calibration tables are JSON objects from stringified raw keys to values,
//! e.g. `{"210": 0.0, "211": 0.12}`.

pub mod config;
pub mod output;

pub use config::{
    CalibrationConfig, Config, ConfigError, TimingConfig, ValidationError, default_config_path,
};
pub use output::{event_line, write_events};
