//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bleherd_core::{
    CalibrationSet, CalibrationTable, DeviceEvent, Driver, DriverConfig, EventReceiver,
    MockTransport,
};
use bleherd_types::{AddressKind, Advertisement, QuantityKind, handles};

pub const SENSOR: &str = "C4:7C:8D:6A:12:34";
pub const TAG: &str = "F1:22:33:44:55:66";

/// Tables where every key maps to a tenth of itself.
pub fn calibration() -> CalibrationSet {
    let table = |kind: QuantityKind| {
        let (min, max) = kind.domain();
        CalibrationTable::from_entries(
            kind,
            (min..=max)
                .step_by(kind.key_step() as usize)
                .map(|k| (k, f64::from(k) / 10.0)),
        )
    };
    CalibrationSet::new(
        table(QuantityKind::Illuminance),
        table(QuantityKind::SoilMoisture),
        table(QuantityKind::Temperature),
    )
    .unwrap()
}

pub fn sensor_advertisement() -> Advertisement {
    Advertisement::new(SENSOR, AddressKind::Public).with_service(handles::PLANT_SENSOR_SERVICE)
}

pub fn tag_advertisement() -> Advertisement {
    Advertisement::new(TAG, AddressKind::Random).with_service(handles::LOCATOR_TAG_SERVICE)
}

pub fn driver(mock: &Arc<MockTransport>) -> Driver {
    driver_with_config(mock, DriverConfig::default())
}

pub fn driver_with_config(mock: &Arc<MockTransport>, config: DriverConfig) -> Driver {
    Driver::new(mock.clone(), calibration(), config).unwrap()
}

/// Route driver logs through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("bleherd_core=debug")
        .try_init();
}

/// Start the driver, advertise and give the runtime a moment to connect.
pub async fn started(mock: &Arc<MockTransport>, advertisement: Advertisement) -> Driver {
    init_tracing();
    let driver = driver(mock);
    driver.start().await.unwrap();
    mock.advertise(advertisement);
    settle().await;
    driver
}

/// Let spawned tasks run without crossing any protocol timer.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Wait for the first event matching `pick`.
pub async fn next_matching<T>(
    events: &mut EventReceiver,
    mut pick: impl FnMut(DeviceEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("no matching event")
}
