//! Raw reading to physical unit conversion.
//!
//! Each quantity has a lookup table keyed by the raw integer the sensor
//! reports. A raw value is first clamped into the quantity's domain (and,
//! for illuminance, floored onto the table's 10-step grid), then looked up
//! by exact key.
//!
//! Tables are stored as JSON objects mapping stringified integers to floats:
//!
//! ```json
//! { "210": 0.0, "211": 0.04, "212": 0.08 }
//! ```

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use bleherd_types::QuantityKind;

use crate::error::{Error, Result};

/// Lookup table for one quantity. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    kind: QuantityKind,
    entries: HashMap<u16, f64>,
}

impl CalibrationTable {
    /// Build a table from `(key, value)` pairs.
    pub fn from_entries(kind: QuantityKind, entries: impl IntoIterator<Item = (u16, f64)>) -> Self {
        Self {
            kind,
            entries: entries.into_iter().collect(),
        }
    }

    /// Parse a table from its JSON text.
    pub fn from_json_str(kind: QuantityKind, text: &str) -> Result<Self> {
        parse_entries(text)
            .map(|entries| Self { kind, entries })
            .map_err(|reason| Error::invalid_config(format!("{} table: {}", kind, reason)))
    }

    /// Read and parse a table file.
    pub fn load(kind: QuantityKind, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::calibration_load(path, e.to_string()))?;
        let entries = parse_entries(&text).map_err(|reason| Error::calibration_load(path, reason))?;
        debug!(
            "Loaded {} calibration entries for {} from {}",
            entries.len(),
            kind,
            path.display()
        );
        Ok(Self { kind, entries })
    }

    /// Quantity this table calibrates.
    pub fn kind(&self) -> QuantityKind {
        self.kind
    }

    /// Exact-key lookup.
    pub fn get(&self, key: u16) -> Option<f64> {
        self.entries.get(&key).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys on the clamped grid that have no entry.
    pub fn missing_keys(&self) -> Vec<u16> {
        let (min, max) = self.kind.domain();
        let step = self.kind.key_step() as usize;
        (min..=max)
            .step_by(step)
            .filter(|key| !self.entries.contains_key(key))
            .collect()
    }
}

fn parse_entries(text: &str) -> std::result::Result<HashMap<u16, f64>, String> {
    let raw: HashMap<String, f64> = serde_json::from_str(text).map_err(|e| e.to_string())?;
    raw.into_iter()
        .map(|(key, value)| {
            key.trim()
                .parse::<u16>()
                .map(|key| (key, value))
                .map_err(|_| format!("key {:?} is not an integer in 0..=65535", key))
        })
        .collect()
}

/// The three calibration tables, shared read-only by every session.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSet {
    illuminance: CalibrationTable,
    moisture: CalibrationTable,
    temperature: CalibrationTable,
}

impl CalibrationSet {
    /// Assemble a set from one table per quantity.
    ///
    /// Fails if a table was loaded for the wrong quantity.
    pub fn new(
        illuminance: CalibrationTable,
        moisture: CalibrationTable,
        temperature: CalibrationTable,
    ) -> Result<Self> {
        for (expected, table) in [
            (QuantityKind::Illuminance, &illuminance),
            (QuantityKind::SoilMoisture, &moisture),
            (QuantityKind::Temperature, &temperature),
        ] {
            if table.kind() != expected {
                return Err(Error::invalid_config(format!(
                    "expected a {} table, got {}",
                    expected,
                    table.kind()
                )));
            }
        }
        Ok(Self {
            illuminance,
            moisture,
            temperature,
        })
    }

    /// Load all three tables from disk.
    pub fn load(
        illuminance: impl AsRef<Path>,
        moisture: impl AsRef<Path>,
        temperature: impl AsRef<Path>,
    ) -> Result<Self> {
        Self::new(
            CalibrationTable::load(QuantityKind::Illuminance, illuminance)?,
            CalibrationTable::load(QuantityKind::SoilMoisture, moisture)?,
            CalibrationTable::load(QuantityKind::Temperature, temperature)?,
        )
    }

    /// The table for one quantity.
    pub fn table(&self, kind: QuantityKind) -> &CalibrationTable {
        match kind {
            QuantityKind::Illuminance => &self.illuminance,
            QuantityKind::SoilMoisture => &self.moisture,
            QuantityKind::Temperature => &self.temperature,
        }
    }

    /// Clamp `raw` and look it up, reporting a missing key as an error.
    pub fn try_calibrate(&self, kind: QuantityKind, raw: u16) -> Result<f64> {
        let key = kind.lookup_key(raw);
        self.table(kind)
            .get(key)
            .ok_or(Error::CalibrationData { kind, key })
    }

    /// Clamp `raw` and look it up.
    ///
    /// A missing key is a data defect: it is logged and `0.0` is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use bleherd_core::{CalibrationSet, CalibrationTable};
    /// use bleherd_types::QuantityKind;
    ///
    /// let set = CalibrationSet::new(
    ///     CalibrationTable::from_entries(QuantityKind::Illuminance, [(120, 3.5)]),
    ///     CalibrationTable::from_entries(QuantityKind::SoilMoisture, [(210, 0.0)]),
    ///     CalibrationTable::from_entries(QuantityKind::Temperature, []),
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(set.calibrate(QuantityKind::Illuminance, 127), 3.5);
    /// assert_eq!(set.calibrate(QuantityKind::SoilMoisture, 50), 0.0);
    /// assert_eq!(set.calibrate(QuantityKind::Temperature, 700), 0.0);
    /// ```
    pub fn calibrate(&self, kind: QuantityKind, raw: u16) -> f64 {
        match self.try_calibrate(kind, raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}", e);
                0.0
            }
        }
    }

    /// Missing keys per quantity, skipping complete tables.
    pub fn gaps(&self) -> Vec<(QuantityKind, Vec<u16>)> {
        QuantityKind::ALL
            .into_iter()
            .map(|kind| (kind, self.table(kind).missing_keys()))
            .filter(|(_, missing)| !missing.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn linear(kind: QuantityKind) -> CalibrationTable {
        let (min, max) = kind.domain();
        let step = kind.key_step() as usize;
        CalibrationTable::from_entries(
            kind,
            (min..=max).step_by(step).map(|k| (k, f64::from(k) / 10.0)),
        )
    }

    fn full_set() -> CalibrationSet {
        CalibrationSet::new(
            linear(QuantityKind::Illuminance),
            linear(QuantityKind::SoilMoisture),
            linear(QuantityKind::Temperature),
        )
        .unwrap()
    }

    #[test]
    fn test_moisture_below_domain_uses_minimum() {
        let set = full_set();
        assert_eq!(
            set.calibrate(QuantityKind::SoilMoisture, 50),
            set.calibrate(QuantityKind::SoilMoisture, 210)
        );
        assert_eq!(
            set.calibrate(QuantityKind::SoilMoisture, 9000),
            set.calibrate(QuantityKind::SoilMoisture, 700)
        );
    }

    #[test]
    fn test_illuminance_floors_before_lookup() {
        let set = full_set();
        assert_eq!(
            set.calibrate(QuantityKind::Illuminance, 123),
            set.calibrate(QuantityKind::Illuminance, 120)
        );
        assert_eq!(set.calibrate(QuantityKind::Illuminance, 123), 12.0);
    }

    #[test]
    fn test_missing_key_yields_zero() {
        let mut set = full_set();
        set.temperature = CalibrationTable::from_entries(QuantityKind::Temperature, [(210, 1.0)]);
        assert_eq!(set.calibrate(QuantityKind::Temperature, 700), 0.0);
        assert!(matches!(
            set.try_calibrate(QuantityKind::Temperature, 700),
            Err(Error::CalibrationData {
                kind: QuantityKind::Temperature,
                key: 700
            })
        ));
    }

    #[test]
    fn test_from_json_str() {
        let table =
            CalibrationTable::from_json_str(QuantityKind::SoilMoisture, r#"{"210": 0.0, "211": 0.5}"#)
                .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(211), Some(0.5));
        assert_eq!(table.get(212), None);
    }

    #[test]
    fn test_from_json_str_rejects_bad_keys() {
        let err = CalibrationTable::from_json_str(QuantityKind::SoilMoisture, r#"{"abc": 1.0}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(err.to_string().contains("abc"));

        assert!(CalibrationTable::from_json_str(QuantityKind::SoilMoisture, "[1, 2]").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"700": 23.5}}"#).unwrap();

        let table = CalibrationTable::load(QuantityKind::Temperature, file.path()).unwrap();
        assert_eq!(table.get(700), Some(23.5));
        assert_eq!(table.kind(), QuantityKind::Temperature);
    }

    #[test]
    fn test_load_missing_file() {
        let err = CalibrationTable::load(QuantityKind::Temperature, "/nonexistent/temperature.json")
            .unwrap_err();
        assert!(matches!(err, Error::CalibrationLoad { .. }));
        assert!(err.to_string().contains("/nonexistent/temperature.json"));
    }

    #[test]
    fn test_missing_keys() {
        let table = CalibrationTable::from_entries(
            QuantityKind::SoilMoisture,
            (210..=700).filter(|k| *k != 300).map(|k| (k, 0.0)),
        );
        assert_eq!(table.missing_keys(), vec![300]);
        assert!(linear(QuantityKind::Illuminance).missing_keys().is_empty());
        assert!(full_set().gaps().is_empty());
    }

    #[test]
    fn test_set_rejects_swapped_tables() {
        let result = CalibrationSet::new(
            linear(QuantityKind::SoilMoisture),
            linear(QuantityKind::SoilMoisture),
            linear(QuantityKind::Temperature),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn sparse_set() -> CalibrationSet {
        CalibrationSet::new(
            CalibrationTable::from_entries(QuantityKind::Illuminance, [(0, 0.0)]),
            CalibrationTable::from_entries(QuantityKind::SoilMoisture, [(210, 0.0)]),
            CalibrationTable::from_entries(QuantityKind::Temperature, [(1372, 40.0)]),
        )
        .unwrap()
    }

    proptest! {
        /// Calibrating any raw value against an incomplete table never panics.
        #[test]
        fn calibrate_never_panics(raw: u16) {
            let set = sparse_set();
            for kind in QuantityKind::ALL {
                let _ = set.calibrate(kind, raw);
            }
        }

        /// Every raw value lands on a key inside the domain.
        #[test]
        fn lookup_key_stays_in_domain(raw: u16) {
            for kind in QuantityKind::ALL {
                let (min, max) = kind.domain();
                let key = kind.lookup_key(raw);
                prop_assert!(key >= min && key <= max);
                prop_assert_eq!(key % kind.key_step(), 0);
            }
        }
    }
}
