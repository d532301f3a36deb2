//! [`Transport`] implementation on top of btleplug.
//!
//! btleplug addresses characteristics by UUID, while the peripherals here
//! are driven by ATT handle. [`AttributeMap`] bridges the two: command
//! payloads and subscription ranges are resolved to characteristics through
//! it, and notifications are mapped back to handles before they reach a
//! session.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    AddressType, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bleherd_types::{AddressKind, Advertisement, ParseError, ParseResult, handles};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::transport::{DiscoverySink, EventSink, NotifyRange, Transport};

/// Upper bound for a single GATT operation.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Bidirectional mapping between attribute handles and characteristic UUIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMap {
    by_handle: HashMap<u16, Uuid>,
}

impl Default for AttributeMap {
    /// Handles of the plant sensor and locator tag firmware.
    fn default() -> Self {
        let mut map = Self::empty();
        map.insert(handles::ILLUMINANCE_HANDLE, handles::ILLUMINANCE_CHARACTERISTIC);
        map.insert(handles::TEMPERATURE_HANDLE, handles::TEMPERATURE_CHARACTERISTIC);
        map.insert(handles::MOISTURE_HANDLE, handles::MOISTURE_CHARACTERISTIC);
        map.insert(handles::LIVE_MODE_HANDLE, handles::LIVE_MODE_CHARACTERISTIC);
        map.insert(handles::BATTERY_HANDLE, handles::BATTERY_LEVEL_CHARACTERISTIC);
        map.insert(handles::ALERT_LEVEL_HANDLE, handles::ALERT_LEVEL_CHARACTERISTIC);
        map
    }
}

impl AttributeMap {
    /// A map with no entries.
    pub fn empty() -> Self {
        Self {
            by_handle: HashMap::new(),
        }
    }

    /// Add or replace a mapping.
    pub fn insert(&mut self, handle: u16, uuid: Uuid) {
        self.by_handle.insert(handle, uuid);
    }

    /// Characteristic UUID for a handle.
    pub fn uuid(&self, handle: u16) -> Option<Uuid> {
        self.by_handle.get(&handle).copied()
    }

    /// Handle for a characteristic UUID.
    pub fn handle(&self, uuid: Uuid) -> Option<u16> {
        self.by_handle
            .iter()
            .find(|(_, u)| **u == uuid)
            .map(|(h, _)| *h)
    }

    /// Mapped handles inside a subscription range.
    pub fn handles_in(&self, range: &NotifyRange) -> Vec<(u16, Uuid)> {
        let mut found: Vec<_> = self
            .by_handle
            .iter()
            .filter(|(h, _)| range.contains(**h))
            .map(|(h, u)| (*h, *u))
            .collect();
        found.sort_unstable_by_key(|(h, _)| *h);
        found
    }
}

/// A decoded ATT write payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttWrite {
    /// Target handle.
    pub handle: u16,
    /// Value to write.
    pub value: Vec<u8>,
    /// Write Request (`true`) or Write Command (`false`).
    pub with_response: bool,
}

impl AttWrite {
    /// Split a raw payload into opcode, handle and value.
    ///
    /// # Examples
    ///
    /// ```
    /// use bleherd_core::ble::AttWrite;
    ///
    /// let write = AttWrite::parse(&[0x12, 0x1b, 0x00, 0x02]).unwrap();
    /// assert_eq!(write.handle, 0x1b);
    /// assert_eq!(write.value, vec![0x02]);
    /// assert!(write.with_response);
    /// ```
    pub fn parse(payload: &[u8]) -> ParseResult<Self> {
        let [opcode, lo, hi, value @ ..] = payload else {
            return Err(ParseError::InsufficientBytes {
                expected: 3,
                actual: payload.len(),
            });
        };
        let with_response = match *opcode {
            handles::ATT_WRITE_REQUEST => true,
            handles::ATT_WRITE_COMMAND => false,
            other => {
                return Err(ParseError::InvalidValue(format!(
                    "unsupported ATT opcode 0x{:02x}",
                    other
                )));
            }
        };
        Ok(Self {
            handle: u16::from_le_bytes([*lo, *hi]),
            value: value.to_vec(),
            with_response,
        })
    }
}

/// Format a peripheral ID as a string.
fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Build an advertisement from adapter properties.
///
/// On macOS where addresses are 00:00:00:00:00:00, the peripheral ID stands
/// in for the address.
fn advertisement_from(id: &PeripheralId, props: &PeripheralProperties) -> Advertisement {
    let address = props.address.to_string();
    let address = if address == "00:00:00:00:00:00" {
        format_peripheral_id(id)
    } else {
        address
    };
    Advertisement {
        address,
        address_kind: match props.address_type {
            Some(AddressType::Random) => AddressKind::Random,
            _ => AddressKind::Public,
        },
        local_name: props.local_name.clone(),
        services: props.services.clone(),
        rssi: props.rssi,
    }
}

async fn with_timeout<T, F>(operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, btleplug::Error>>,
{
    tokio::time::timeout(OPERATION_TIMEOUT, fut)
        .await
        .map_err(|_| Error::timeout(operation, OPERATION_TIMEOUT))?
        .map_err(Error::from)
}

struct BtleInner {
    adapter: Adapter,
    attributes: AttributeMap,
    sinks: RwLock<HashMap<String, Arc<dyn EventSink>>>,
    discovery: RwLock<Option<Arc<dyn DiscoverySink>>>,
    peripherals: tokio::sync::RwLock<HashMap<String, Peripheral>>,
    addresses: tokio::sync::RwLock<HashMap<PeripheralId, String>>,
    pumps: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BtleInner {
    fn sink(&self, address: &str) -> Option<Arc<dyn EventSink>> {
        self.sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(address)
            .cloned()
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        self.peripherals
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| {
                Error::connection_failed(
                    Some(address.to_string()),
                    ConnectionFailureReason::UnknownPeripheral,
                )
            })
    }

    async fn characteristic(&self, address: &str, handle: u16) -> Result<(Peripheral, Characteristic)> {
        let uuid = self
            .attributes
            .uuid(handle)
            .ok_or(Error::CharacteristicNotFound { handle })?;
        let peripheral = self.peripheral(address).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(Error::CharacteristicNotFound { handle })?;
        Ok((peripheral, characteristic))
    }

    async fn on_seen(&self, id: PeripheralId) {
        let peripheral = match self.adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("Unknown peripheral {:?}: {}", id, e);
                return;
            }
        };
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            Ok(None) => return,
            Err(e) => {
                debug!("No properties for {:?}: {}", id, e);
                return;
            }
        };
        let advertisement = advertisement_from(&id, &props);

        self.addresses
            .write()
            .await
            .insert(id, advertisement.address.clone());
        self.peripherals
            .write()
            .await
            .insert(advertisement.address.clone(), peripheral);

        let discovery = self
            .discovery
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(discovery) = discovery {
            discovery.on_advertisement(advertisement);
        }
    }

    async fn on_lost(&self, id: PeripheralId) {
        let Some(address) = self.addresses.read().await.get(&id).cloned() else {
            return;
        };
        if let Some(pump) = self.pumps.lock().await.remove(&address) {
            pump.abort();
        }
        debug!("{}: adapter reported disconnect", address);
        if let Some(sink) = self.sink(&address) {
            sink.on_disconnected();
        }
    }

    async fn establish(&self, address: &str, peripheral: Peripheral) -> Result<()> {
        with_timeout("connect", peripheral.connect()).await?;
        with_timeout("discover services", peripheral.discover_services()).await?;
        debug!(
            "{}: {} characteristics discovered",
            address,
            peripheral.characteristics().len()
        );

        let mut stream = peripheral.notifications().await?;
        let sink = self.sink(address);
        let attributes = self.attributes.clone();
        let pump_address = address.to_string();
        let pump = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                match attributes.handle(notification.uuid) {
                    Some(handle) => {
                        if let Some(sink) = &sink {
                            sink.on_notification(handle, &notification.value);
                        }
                    }
                    None => debug!(
                        "{}: notification from unmapped characteristic {}",
                        pump_address, notification.uuid
                    ),
                }
            }
        });
        if let Some(previous) = self.pumps.lock().await.insert(address.to_string(), pump) {
            previous.abort();
        }
        Ok(())
    }
}

/// btleplug-backed transport using the first Bluetooth adapter.
#[derive(Clone)]
pub struct BtleTransport {
    inner: Arc<BtleInner>,
}

impl std::fmt::Debug for BtleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleTransport")
            .field("attributes", &self.inner.attributes)
            .finish_non_exhaustive()
    }
}

impl BtleTransport {
    /// Open the first adapter with the default attribute map.
    pub async fn new() -> Result<Self> {
        Self::with_attributes(AttributeMap::default()).await
    }

    /// Open the first adapter with a custom attribute map.
    pub async fn with_attributes(attributes: AttributeMap) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next().ok_or_else(|| {
            Error::connection_failed(None, ConnectionFailureReason::AdapterUnavailable)
        })?;
        info!("Using Bluetooth adapter {}", adapter.adapter_info().await?);

        let inner = Arc::new(BtleInner {
            adapter,
            attributes,
            sinks: RwLock::new(HashMap::new()),
            discovery: RwLock::new(None),
            peripherals: tokio::sync::RwLock::new(HashMap::new()),
            addresses: tokio::sync::RwLock::new(HashMap::new()),
            pumps: tokio::sync::Mutex::new(HashMap::new()),
        });

        let mut events = inner.adapter.events().await?;
        let weak: Weak<BtleInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => inner.on_seen(id).await,
                    CentralEvent::DeviceDisconnected(id) => inner.on_lost(id).await,
                    _ => {}
                }
            }
            debug!("Adapter event stream ended");
        });

        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn connect(&self, address: &str, kind: AddressKind) -> Result<()> {
        let peripheral = self.inner.peripheral(address).await?;
        debug!("{}: connecting ({} address)", address, kind);

        let inner = Arc::clone(&self.inner);
        let address = address.to_string();
        tokio::spawn(async move {
            match inner.establish(&address, peripheral).await {
                Ok(()) => {
                    if let Some(sink) = inner.sink(&address) {
                        sink.on_connected();
                    }
                }
                Err(e) => {
                    warn!("{}: connect failed: {}", address, e);
                    if let Some(sink) = inner.sink(&address) {
                        sink.on_disconnected();
                    }
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        if let Some(pump) = self.inner.pumps.lock().await.remove(address) {
            pump.abort();
        }
        let peripheral = self.inner.peripheral(address).await?;
        with_timeout("disconnect", peripheral.disconnect()).await
    }

    async fn notify(&self, address: &str, range: NotifyRange) -> Result<()> {
        let peripheral = self.inner.peripheral(address).await?;
        let wanted = self.inner.attributes.handles_in(&range);
        let characteristics = peripheral.characteristics();

        for (handle, uuid) in wanted {
            let Some(characteristic) = characteristics.iter().find(|c| c.uuid == uuid) else {
                debug!("{}: handle 0x{:04x} not present", address, handle);
                continue;
            };
            if range.enable {
                with_timeout("subscribe", peripheral.subscribe(characteristic)).await?;
            } else {
                with_timeout("unsubscribe", peripheral.unsubscribe(characteristic)).await?;
            }
            debug!(
                "{}: {} handle 0x{:04x}",
                address,
                if range.enable { "subscribed" } else { "unsubscribed" },
                handle
            );
        }
        Ok(())
    }

    async fn send_command(&self, address: &str, payload: &[u8]) -> Result<()> {
        let write = AttWrite::parse(payload)?;
        let (peripheral, characteristic) = self.inner.characteristic(address, write.handle).await?;
        let write_type = if write.with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        tokio::time::timeout(
            OPERATION_TIMEOUT,
            peripheral.write(&characteristic, &write.value, write_type),
        )
        .await
        .map_err(|_| Error::timeout(format!("write handle 0x{:04x}", write.handle), OPERATION_TIMEOUT))?
        .map_err(|e| Error::write_failed(write.handle, e.to_string()))
    }

    async fn read_attribute(&self, address: &str, handle: u16) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.inner.characteristic(address, handle).await?;
        with_timeout("read", peripheral.read(&characteristic)).await
    }

    fn register_sink(&self, address: &str, sink: Arc<dyn EventSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(address.to_string(), sink);
    }

    fn set_discovery_sink(&self, sink: Arc<dyn DiscoverySink>) {
        *self
            .inner
            .discovery
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }

    async fn start_scanning(&self) -> Result<()> {
        self.inner.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for peripherals");
        Ok(())
    }
}
