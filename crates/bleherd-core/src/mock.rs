//! In-memory transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without any radio. Every request
//! is appended to an operation log, connect outcomes are scripted, and tests
//! inject advertisements, notifications and link drops through the same sink
//! callbacks a real transport would use.
//!
//! # Features
//!
//! - **Operation log**: assert on the exact order of connects, subscriptions and commands
//! - **Scripted connects**: succeed, fail, reject, hang or complete after a delay
//! - **Failure injection**: make command writes fail
//!
//! # Example
//!
//! ```
//! use bleherd_core::{MockTransport, Transport};
//! use bleherd_core::mock::ConnectBehavior;
//! use bleherd_types::AddressKind;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = MockTransport::new();
//!     transport.set_connect_behavior(ConnectBehavior::Reject);
//!     assert!(transport.connect("AA:BB", AddressKind::Random).await.is_err());
//!     assert_eq!(transport.connect_count("AA:BB"), 1);
//! }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use bleherd_types::{AddressKind, Advertisement};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::transport::{DiscoverySink, EventSink, NotifyRange, Transport};

/// A request seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    /// `connect` was called.
    Connect { address: String },
    /// `disconnect` was called.
    Disconnect { address: String },
    /// `notify` was called.
    Notify { address: String, range: NotifyRange },
    /// `send_command` was called.
    Command { address: String, payload: Vec<u8> },
    /// `read_attribute` was called.
    Read { address: String, handle: u16 },
}

impl MockOp {
    /// The address the request targeted.
    pub fn address(&self) -> &str {
        match self {
            MockOp::Connect { address }
            | MockOp::Disconnect { address }
            | MockOp::Notify { address, .. }
            | MockOp::Command { address, .. }
            | MockOp::Read { address, .. } => address,
        }
    }
}

/// What happens when `connect` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Report the link up before `connect` returns.
    Succeed,
    /// Report the link up after a delay.
    Delayed(Duration),
    /// Accept the request, then report a disconnect.
    Fail,
    /// Return an error from `connect`.
    Reject,
    /// Accept the request and never answer.
    Hang,
}

#[derive(Default)]
struct MockState {
    ops: Vec<MockOp>,
    sinks: HashMap<String, Arc<dyn EventSink>>,
    discovery: Option<Arc<dyn DiscoverySink>>,
    connected: HashSet<String>,
    attributes: HashMap<(String, u16), Vec<u8>>,
    scripted: VecDeque<ConnectBehavior>,
    scanning: bool,
    fail_commands: bool,
}

/// A transport that records everything and talks to nothing.
pub struct MockTransport {
    state: Mutex<MockState>,
    default_connect: Mutex<ConnectBehavior>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MockTransport")
            .field("ops", &state.ops.len())
            .field("connected", &state.connected)
            .field("scanning", &state.scanning)
            .finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock whose connects succeed immediately.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            default_connect: Mutex::new(ConnectBehavior::Succeed),
        }
    }

    /// Create a mock with a given default connect behavior.
    pub fn with_connect_behavior(behavior: ConnectBehavior) -> Self {
        let mock = Self::new();
        mock.set_connect_behavior(behavior);
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Change what unscripted connects do.
    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        *self
            .default_connect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = behavior;
    }

    /// Queue outcomes for the next connects, in order. Later connects fall
    /// back to the default behavior.
    pub fn script_connects(&self, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        self.state().scripted.extend(behaviors);
    }

    /// Make every command write fail (or succeed again).
    pub fn set_fail_commands(&self, fail: bool) {
        self.state().fail_commands = fail;
    }

    /// Value returned when `handle` is read on `address`.
    pub fn set_attribute(&self, address: &str, handle: u16, value: impl Into<Vec<u8>>) {
        self.state()
            .attributes
            .insert((address.to_string(), handle), value.into());
    }

    /// Every request so far, in order.
    pub fn ops(&self) -> Vec<MockOp> {
        self.state().ops.clone()
    }

    /// Requests that targeted `address`, in order.
    pub fn ops_for(&self, address: &str) -> Vec<MockOp> {
        self.state()
            .ops
            .iter()
            .filter(|op| op.address() == address)
            .cloned()
            .collect()
    }

    /// Forget the operation log.
    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Command payloads sent to `address`, in order.
    pub fn commands(&self, address: &str) -> Vec<Vec<u8>> {
        self.ops_for(address)
            .into_iter()
            .filter_map(|op| match op {
                MockOp::Command { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// Number of connect requests for `address`.
    pub fn connect_count(&self, address: &str) -> usize {
        self.ops_for(address)
            .iter()
            .filter(|op| matches!(op, MockOp::Connect { .. }))
            .count()
    }

    /// Number of enabling subscriptions for `address`.
    pub fn subscribe_count(&self, address: &str) -> usize {
        self.ops_for(address)
            .iter()
            .filter(|op| matches!(op, MockOp::Notify { range, .. } if range.enable))
            .count()
    }

    /// Whether the mock considers `address` linked.
    pub fn is_connected(&self, address: &str) -> bool {
        self.state().connected.contains(address)
    }

    /// Whether `start_scanning` was called.
    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    fn sink(&self, address: &str) -> Option<Arc<dyn EventSink>> {
        self.state().sinks.get(address).cloned()
    }

    /// Deliver an advertisement to the discovery sink.
    pub fn advertise(&self, advertisement: Advertisement) {
        let discovery = self.state().discovery.clone();
        if let Some(discovery) = discovery {
            discovery.on_advertisement(advertisement);
        }
    }

    /// Push a notification from the peripheral.
    pub fn emit_notification(&self, address: &str, handle: u16, data: &[u8]) {
        if let Some(sink) = self.sink(address) {
            sink.on_notification(handle, data);
        }
    }

    /// Simulate the peripheral bringing the link up on its own.
    pub fn link_up(&self, address: &str) {
        self.state().connected.insert(address.to_string());
        if let Some(sink) = self.sink(address) {
            sink.on_connected();
        }
    }

    /// Simulate the link going down.
    pub fn drop_link(&self, address: &str) {
        self.state().connected.remove(address);
        if let Some(sink) = self.sink(address) {
            sink.on_disconnected();
        }
    }

    fn record(&self, op: MockOp) {
        self.state().ops.push(op);
    }

    fn check_connected(&self, address: &str) -> Result<()> {
        if self.state().connected.contains(address) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str, _kind: AddressKind) -> Result<()> {
        self.record(MockOp::Connect {
            address: address.to_string(),
        });

        let behavior = {
            let scripted = self.state().scripted.pop_front();
            scripted.unwrap_or_else(|| {
                *self
                    .default_connect
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
            })
        };

        match behavior {
            ConnectBehavior::Succeed => self.link_up(address),
            ConnectBehavior::Delayed(delay) => {
                let sink = self.sink(address);
                self.state().connected.insert(address.to_string());
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(sink) = sink {
                        sink.on_connected();
                    }
                });
            }
            ConnectBehavior::Fail => {
                if let Some(sink) = self.sink(address) {
                    sink.on_disconnected();
                }
            }
            ConnectBehavior::Reject => {
                return Err(Error::connection_failed(
                    Some(address.to_string()),
                    ConnectionFailureReason::Other("rejected by mock".to_string()),
                ));
            }
            ConnectBehavior::Hang => {}
        }
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        self.record(MockOp::Disconnect {
            address: address.to_string(),
        });
        let was_connected = self.state().connected.remove(address);
        if was_connected && let Some(sink) = self.sink(address) {
            sink.on_disconnected();
        }
        Ok(())
    }

    async fn notify(&self, address: &str, range: NotifyRange) -> Result<()> {
        self.record(MockOp::Notify {
            address: address.to_string(),
            range,
        });
        self.check_connected(address)
    }

    async fn send_command(&self, address: &str, payload: &[u8]) -> Result<()> {
        self.record(MockOp::Command {
            address: address.to_string(),
            payload: payload.to_vec(),
        });
        self.check_connected(address)?;
        if self.state().fail_commands {
            let handle = payload
                .get(1..3)
                .map(|h| u16::from_le_bytes([h[0], h[1]]))
                .unwrap_or_default();
            return Err(Error::write_failed(handle, "injected failure"));
        }
        Ok(())
    }

    async fn read_attribute(&self, address: &str, handle: u16) -> Result<Vec<u8>> {
        self.record(MockOp::Read {
            address: address.to_string(),
            handle,
        });
        self.check_connected(address)?;
        self.state()
            .attributes
            .get(&(address.to_string(), handle))
            .cloned()
            .ok_or(Error::CharacteristicNotFound { handle })
    }

    fn register_sink(&self, address: &str, sink: Arc<dyn EventSink>) {
        self.state().sinks.insert(address.to_string(), sink);
    }

    fn set_discovery_sink(&self, sink: Arc<dyn DiscoverySink>) {
        self.state().discovery = Some(sink);
    }

    async fn start_scanning(&self) -> Result<()> {
        self.state().scanning = true;
        Ok(())
    }
}
