//! The process-wide owner of every session.
//!
//! [`Driver`] wires the transport to the registry: advertisements from the
//! scanner create sessions, each session gets a supervisor task and a
//! notification router task, and the public API (`activate`, `identify`,
//! `read_battery`) looks sessions up by address.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bleherd_core::{BtleTransport, CalibrationSet, Driver, DriverConfig};
//!
//! let transport = Arc::new(BtleTransport::new().await?);
//! let calibration = CalibrationSet::load("light.json", "moisture.json", "temp.json")?;
//! let driver = Driver::new(transport, calibration, DriverConfig::default())?;
//!
//! let mut events = driver.events();
//! driver.start().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bleherd_types::{AddressKind, Advertisement, DeviceRole, QuantityKind, SensorReading};

use crate::actuation::{
    ActuationConfig, ActuationProtocol, ActuationRequest, DEFAULT_ACTIVATION_DURATION,
};
use crate::calibration::CalibrationSet;
use crate::clock::{Clock, TokioClock};
use crate::duty_cycle::{DEFAULT_SAMPLE_WINDOW, DEFAULT_SLEEP_WINDOW, DutyCycleScheduler};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, Publisher};
use crate::registry::Registry;
use crate::retry::{
    DEFAULT_ACTUATION_ATTEMPTS, DEFAULT_ACTUATION_BACKOFF, DEFAULT_RECONNECT_DELAY, RetryPolicy,
};
use crate::router::NotificationRouter;
use crate::session::{RunFlag, Session};
use crate::supervisor::SessionSupervisor;
use crate::transport::{DiscoverySink, Transport};

/// Timing and capacity settings for a [`Driver`].
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// How long live streaming stays on per cycle.
    pub sample_window: Duration,
    /// Pause between streaming windows.
    pub sleep_window: Duration,
    /// Delay between passive reconnect attempts.
    pub reconnect_delay: Duration,
    /// How long to wait for a connect to complete.
    pub connect_timeout: Duration,
    /// How long a locator buzzes.
    pub activation_duration: Duration,
    /// Connect attempts allowed per activation.
    pub actuation_attempts: u32,
    /// Delay between activation connect attempts.
    pub actuation_backoff: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sample_window: DEFAULT_SAMPLE_WINDOW,
            sleep_window: DEFAULT_SLEEP_WINDOW,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: Duration::from_secs(10),
            activation_duration: DEFAULT_ACTIVATION_DURATION,
            actuation_attempts: DEFAULT_ACTUATION_ATTEMPTS,
            actuation_backoff: DEFAULT_ACTUATION_BACKOFF,
            event_capacity: 256,
        }
    }
}

impl DriverConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sample window.
    #[must_use]
    pub fn sample_window(mut self, window: Duration) -> Self {
        self.sample_window = window;
        self
    }

    /// Set the sleep window.
    #[must_use]
    pub fn sleep_window(mut self, window: Duration) -> Self {
        self.sleep_window = window;
        self
    }

    /// Set the passive reconnect delay.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the buzz duration.
    #[must_use]
    pub fn activation_duration(mut self, duration: Duration) -> Self {
        self.activation_duration = duration;
        self
    }

    /// Set activation connect attempts and the delay between them.
    #[must_use]
    pub fn actuation_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.actuation_attempts = attempts;
        self.actuation_backoff = backoff;
        self
    }

    /// Check that every duration is usable.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sample_window", self.sample_window),
            ("sleep_window", self.sleep_window),
            ("connect_timeout", self.connect_timeout),
            ("activation_duration", self.activation_duration),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{} must be > 0", name)));
            }
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        self.reconnect_policy().validate()?;
        self.actuation_config().retry.validate()
    }

    /// Policy for passive reconnection.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::passive(self.reconnect_delay)
    }

    /// Settings for activations.
    pub fn actuation_config(&self) -> ActuationConfig {
        ActuationConfig {
            retry: RetryPolicy::fixed_delay(self.actuation_backoff)
                .max_attempts(self.actuation_attempts),
            connect_timeout: self.connect_timeout,
            activation_duration: self.activation_duration,
        }
    }
}

struct DriverInner {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: DriverConfig,
    events: EventDispatcher,
    publisher: Arc<dyn Publisher>,
    router: NotificationRouter,
    scheduler: DutyCycleScheduler,
    actuation: ActuationProtocol,
    registry: Registry,
    run: RunFlag,
    shutdown: CancellationToken,
    discovery_started: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

/// Owns the registry, the run flag and all background tasks.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.inner.config)
            .field("running", &self.inner.run.is_running())
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Create a driver using the tokio clock.
    pub fn new(
        transport: Arc<dyn Transport>,
        calibration: CalibrationSet,
        config: DriverConfig,
    ) -> Result<Self> {
        Self::with_clock(transport, calibration, config, Arc::new(TokioClock))
    }

    /// Create a driver with an explicit clock.
    pub fn with_clock(
        transport: Arc<dyn Transport>,
        calibration: CalibrationSet,
        config: DriverConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventDispatcher::new(config.event_capacity);
        let publisher: Arc<dyn Publisher> = Arc::new(events.clone());
        let run = RunFlag::new(false);
        let shutdown = CancellationToken::new();

        let router = NotificationRouter::new(Arc::new(calibration), Arc::clone(&publisher));
        let scheduler = DutyCycleScheduler::new(
            Arc::clone(&transport),
            Arc::clone(&clock),
            config.sample_window,
            config.sleep_window,
        );
        let actuation = ActuationProtocol::new(
            Arc::clone(&transport),
            Arc::clone(&clock),
            Arc::clone(&publisher),
            run.clone(),
            shutdown.clone(),
            config.actuation_config(),
        );

        Ok(Self {
            inner: Arc::new(DriverInner {
                transport,
                clock,
                config,
                events,
                publisher,
                router,
                scheduler,
                actuation,
                registry: Registry::new(),
                run,
                shutdown,
                discovery_started: AtomicBool::new(false),
                tasks: Mutex::new(JoinSet::new()),
            }),
        })
    }

    /// Subscribe to driver events.
    pub fn events(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// The active configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Set the run flag and, the first time, start discovery.
    pub async fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.inner.run.set(true);

        if self.inner.discovery_started.swap(true, Ordering::SeqCst) {
            info!("Driver resumed");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner
            .transport
            .set_discovery_sink(Arc::new(DiscoveryRelay { tx }));

        let weak: Weak<DriverInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        self.inner.tasks.lock().await.spawn(async move {
            loop {
                let advertisement = tokio::select! {
                    adv = rx.recv() => match adv {
                        Some(adv) => adv,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                Driver { inner }.handle_advertisement(advertisement).await;
            }
            debug!("Discovery task stopped");
        });

        self.inner.transport.start_scanning().await?;
        info!("Driver started");
        Ok(())
    }

    /// Clear the run flag. Sessions pause at their next iteration.
    pub fn stop(&self) {
        self.inner.run.set(false);
        info!("Driver stopped");
    }

    /// Whether the run flag is set.
    pub fn is_running(&self) -> bool {
        self.inner.run.is_running()
    }

    /// End every task and disconnect every connected session.
    pub async fn shutdown(&self) {
        info!("Driver shutting down");
        self.inner.run.set(false);
        self.inner.shutdown.cancel();

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        // Deactivation must reach the tags before their links go down.
        self.inner.actuation.drain().await;

        for session in self.inner.registry.all().await {
            if session.is_connected()
                && let Err(e) = self.inner.transport.disconnect(session.address()).await
            {
                warn!("{}: disconnect failed: {}", session.address(), e);
            }
        }
    }

    /// Track a newly advertised peripheral.
    ///
    /// Returns the new session, or `None` if the advertiser is not tracked
    /// (unknown role, rejected, or already registered).
    pub async fn handle_advertisement(&self, advertisement: Advertisement) -> Option<Arc<Session>> {
        let identity = advertisement.identity()?;
        let inner = &self.inner;

        if identity.role == DeviceRole::LocatorTag && identity.address_kind == AddressKind::Public
        {
            debug!("{}: ignoring locator tag with public address", identity.address);
            return None;
        }
        if inner.registry.contains(&identity.address).await {
            return None;
        }

        let (session, notifications) =
            Session::new(identity.clone(), Arc::clone(&inner.publisher), Arc::clone(&inner.clock));
        if !inner.registry.register_if_absent(Arc::clone(&session)).await {
            return None;
        }
        info!("Tracking {}", identity);

        inner
            .transport
            .register_sink(&identity.address, Arc::clone(&session) as _);
        inner.publisher.publish_discovered(&identity, &advertisement);

        let supervisor = SessionSupervisor::new(
            Arc::clone(&session),
            Arc::clone(&inner.transport),
            Arc::clone(&inner.clock),
            inner.scheduler.clone(),
            inner.config.reconnect_policy(),
            inner.config.connect_timeout,
            inner.run.clone(),
            inner.shutdown.clone(),
        );

        let router = inner.router.clone();
        let shutdown = inner.shutdown.clone();
        let mut tasks = inner.tasks.lock().await;
        tasks.spawn(async move {
            tokio::select! {
                _ = router.run(identity, notifications) => {}
                _ = shutdown.cancelled() => {}
            }
        });
        tasks.spawn(supervisor.run());

        Some(session)
    }

    /// Look up a tracked session.
    pub async fn session(&self, address: &str) -> Option<Arc<Session>> {
        self.inner.registry.get(address).await
    }

    /// Every tracked session.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.registry.all().await
    }

    async fn session_with_role(
        &self,
        address: &str,
        role: DeviceRole,
        operation: &str,
    ) -> Result<Arc<Session>> {
        let session = self
            .session(address)
            .await
            .ok_or_else(|| Error::device_not_found(address))?;
        let actual = session.identity().role;
        if actual != role {
            return Err(Error::UnsupportedRole {
                operation: operation.to_string(),
                role: actual,
            });
        }
        Ok(session)
    }

    /// Start buzzing a locator tag.
    pub async fn activate(&self, address: &str) -> Result<ActuationRequest> {
        let session = self
            .session_with_role(address, DeviceRole::LocatorTag, "activate")
            .await?;
        self.inner.actuation.activate(&session)
    }

    /// Buzz a locator tag and wait until it is done.
    pub async fn identify(&self, address: &str) -> Result<()> {
        self.activate(address).await?.wait().await
    }

    /// Read a connected device's battery level.
    pub async fn read_battery(&self, address: &str) -> Result<u16> {
        let session = self
            .session(address)
            .await
            .ok_or_else(|| Error::device_not_found(address))?;
        if !session.is_connected() {
            return Err(Error::NotConnected);
        }
        self.inner
            .router
            .read_battery(self.inner.transport.as_ref(), session.identity())
            .await
    }

    /// Read one quantity from a connected telemetry sensor.
    pub async fn read_quantity(&self, address: &str, kind: QuantityKind) -> Result<SensorReading> {
        let session = self
            .session_with_role(address, DeviceRole::TelemetrySensor, "read_quantity")
            .await?;
        if !session.is_connected() {
            return Err(Error::NotConnected);
        }
        self.inner
            .router
            .read_quantity(self.inner.transport.as_ref(), session.identity(), kind)
            .await
    }
}

/// Forwards advertisements from transport callbacks into the discovery task.
struct DiscoveryRelay {
    tx: mpsc::UnboundedSender<Advertisement>,
}

impl DiscoverySink for DiscoveryRelay {
    fn on_advertisement(&self, advertisement: Advertisement) {
        // Fails only after shutdown.
        let _ = self.tx.send(advertisement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_window, Duration::from_secs(5));
        assert_eq!(config.sleep_window, Duration::from_secs(1800));
        assert_eq!(config.reconnect_policy().max_attempts, None);
        assert_eq!(config.actuation_config().retry.max_attempts, Some(3));
    }

    #[test]
    fn test_config_validation() {
        assert!(DriverConfig::new().sample_window(Duration::ZERO).validate().is_err());
        assert!(
            DriverConfig::new()
                .actuation_retries(0, Duration::from_secs(1))
                .validate()
                .is_err()
        );
        let err = DriverConfig::new()
            .connect_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("connect_timeout"));
    }
}
