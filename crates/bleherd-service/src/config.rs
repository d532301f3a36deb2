//! Daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bleherd_core::DriverConfig;

/// Daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Calibration table locations.
    pub calibration: CalibrationConfig,
    /// Protocol timing.
    pub timing: TimingConfig,
}

impl Config {
    /// Load configuration from the default path, or defaults if there is no file.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use bleherd_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.calibration.validate();
        errors.extend(self.timing.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Driver settings derived from the timing section.
    pub fn driver_config(&self) -> DriverConfig {
        let t = &self.timing;
        DriverConfig::new()
            .sample_window(Duration::from_secs(t.sample_window_secs))
            .sleep_window(Duration::from_secs(t.sleep_window_secs))
            .reconnect_delay(Duration::from_secs(t.reconnect_delay_secs))
            .connect_timeout(Duration::from_secs(t.connect_timeout_secs))
            .activation_duration(Duration::from_secs(t.activation_secs))
            .actuation_retries(
                t.actuation_attempts,
                Duration::from_secs(t.actuation_backoff_secs),
            )
    }
}

/// Paths of the three calibration tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Illuminance table (JSON).
    pub illuminance: PathBuf,
    /// Soil moisture table (JSON).
    pub moisture: PathBuf,
    /// Temperature table (JSON).
    pub temperature: PathBuf,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let dir = default_data_dir();
        Self {
            illuminance: dir.join("light.json"),
            moisture: dir.join("moisture.json"),
            temperature: dir.join("temperature.json"),
        }
    }
}

impl CalibrationConfig {
    /// Validate calibration paths.
    pub fn validate(&self) -> Vec<ValidationError> {
        [
            ("calibration.illuminance", &self.illuminance),
            ("calibration.moisture", &self.moisture),
            ("calibration.temperature", &self.temperature),
        ]
        .into_iter()
        .filter(|(_, path)| path.as_os_str().is_empty())
        .map(|(field, _)| ValidationError {
            field: field.to_string(),
            message: "table path cannot be empty".to_string(),
        })
        .collect()
    }
}

/// Protocol timing, in whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Streaming window per duty cycle.
    pub sample_window_secs: u64,
    /// Sleep between streaming windows.
    pub sleep_window_secs: u64,
    /// Delay between passive reconnect attempts.
    pub reconnect_delay_secs: u64,
    /// Connect timeout.
    pub connect_timeout_secs: u64,
    /// How long a locator buzzes.
    pub activation_secs: u64,
    /// Connect attempts per activation.
    pub actuation_attempts: u32,
    /// Delay between activation connect attempts.
    pub actuation_backoff_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sample_window_secs: 5,
            sleep_window_secs: 30 * 60,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
            activation_secs: 5,
            actuation_attempts: 3,
            actuation_backoff_secs: 2,
        }
    }
}

/// Longest sleep window accepted (one day).
pub const MAX_SLEEP_WINDOW_SECS: u64 = 24 * 60 * 60;

impl TimingConfig {
    /// Validate timing.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let positive = [
            ("timing.sample_window_secs", self.sample_window_secs),
            ("timing.sleep_window_secs", self.sleep_window_secs),
            ("timing.connect_timeout_secs", self.connect_timeout_secs),
            ("timing.activation_secs", self.activation_secs),
            ("timing.actuation_attempts", u64::from(self.actuation_attempts)),
        ];
        for (field, value) in positive {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        if self.sleep_window_secs > MAX_SLEEP_WINDOW_SECS {
            errors.push(ValidationError {
                field: "timing.sleep_window_secs".to_string(),
                message: format!(
                    "sleep window {} is too long (maximum {} seconds / 1 day)",
                    self.sleep_window_secs, MAX_SLEEP_WINDOW_SECS
                ),
            });
        }
        if self.sample_window_secs >= self.sleep_window_secs && self.sleep_window_secs > 0 {
            errors.push(ValidationError {
                field: "timing.sample_window_secs".to_string(),
                message: format!(
                    "sample window {}s must be shorter than the sleep window {}s",
                    self.sample_window_secs, self.sleep_window_secs
                ),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The field path (e.g., `timing.sleep_window_secs`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bleherd")
        .join("config.toml")
}

/// Default directory holding the calibration tables.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bleherd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.sleep_window_secs, 1800);
        assert!(config.calibration.moisture.ends_with("moisture.json"));
    }

    #[test]
    fn test_default_driver_config_matches_core_defaults() {
        assert_eq!(Config::default().driver_config(), DriverConfig::default());
    }

    #[test]
    fn test_partial_timing_section() {
        let toml = r#"
            [timing]
            sleep_window_secs = 600
            actuation_attempts = 5
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.timing.sleep_window_secs, 600);
        assert_eq!(config.timing.actuation_attempts, 5);
        assert_eq!(config.timing.sample_window_secs, 5);

        let driver = config.driver_config();
        assert_eq!(driver.sleep_window, Duration::from_secs(600));
        assert_eq!(driver.actuation_attempts, 5);
        assert!(driver.validate().is_ok());
    }

    #[test]
    fn test_calibration_paths() {
        let toml = r#"
            [calibration]
            illuminance = "/opt/tables/light.json"
            moisture = "/opt/tables/moisture.json"
            temperature = "/opt/tables/temp.json"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.calibration.temperature,
            PathBuf::from("/opt/tables/temp.json")
        );
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = Config::default();
        config.timing.sample_window_secs = 0;
        config.timing.actuation_attempts = 0;
        config.calibration.illuminance = PathBuf::new();

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "calibration.illuminance",
                "timing.sample_window_secs",
                "timing.actuation_attempts",
            ]
        );
    }

    #[test]
    fn test_sleep_window_bounds() {
        let mut config = Config::default();
        config.timing.sleep_window_secs = MAX_SLEEP_WINDOW_SECS + 1;
        assert!(config.validate().is_err());

        config.timing.sleep_window_secs = 5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shorter than the sleep window"));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[timing]\nreconnect_delay_secs = 15\n").unwrap();

        let config = Config::load_validated(&path).unwrap();
        assert_eq!(config.timing.reconnect_delay_secs, 15);
        assert_eq!(config.calibration, CalibrationConfig::default());
    }

    #[test]
    fn test_load_errors_carry_path() {
        let temp_dir = tempfile::tempdir().unwrap();

        let missing = temp_dir.path().join("missing.toml");
        let err = Config::load(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("missing.toml"));

        let broken = temp_dir.path().join("broken.toml");
        std::fs::write(&broken, "[timing\n").unwrap();
        assert!(matches!(
            Config::load(&broken),
            Err(ConfigError::Parse { .. })
        ));

        let wrong_type = temp_dir.path().join("wrong.toml");
        std::fs::write(&wrong_type, "[timing]\nsleep_window_secs = \"long\"\n").unwrap();
        assert!(matches!(
            Config::load(&wrong_type),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError {
            field: "timing.activation_secs".to_string(),
            message: "must be greater than 0".to_string(),
        };
        assert_eq!(err.to_string(), "timing.activation_secs: must be greater than 0");
    }
}
