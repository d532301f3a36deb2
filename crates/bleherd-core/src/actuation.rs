//! Locator tag activation ("buzz").
//!
//! An activation connects if needed (bounded retries), switches the alert on,
//! holds it for a fixed duration and switches it off again. At most one
//! activation runs per device; a second request is rejected, never queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use bleherd_types::handles::{LOCATOR_ACTIVATE, LOCATOR_DEACTIVATE};
use bleherd_types::{LocatorState, PeripheralIdentity};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::events::Publisher;
use crate::retry::{Backoff, RetryPolicy};
use crate::session::{ActuationGuard, RunFlag, Session};
use crate::transport::Transport;

/// Default time the buzzer stays on.
pub const DEFAULT_ACTIVATION_DURATION: Duration = Duration::from_secs(5);

/// Timing of an activation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuationConfig {
    /// Connect retries for a disconnected tag.
    pub retry: RetryPolicy,
    /// How long each connect attempt may take.
    pub connect_timeout: Duration,
    /// How long the buzzer stays on.
    pub activation_duration: Duration,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::actuation(),
            connect_timeout: Duration::from_secs(10),
            activation_duration: DEFAULT_ACTIVATION_DURATION,
        }
    }
}

/// Progress of one activation.
#[derive(Debug)]
pub enum ActuationUpdate {
    /// The alert is on.
    Started,
    /// The alert is off again. Final.
    Stopped,
    /// The activation did not happen. Final.
    Failed(Error),
}

/// Handle to an activation in flight.
///
/// Delivers either `Started` then `Stopped`, or a single `Failed`.
#[derive(Debug)]
pub struct ActuationRequest {
    identity: PeripheralIdentity,
    updates: mpsc::Receiver<ActuationUpdate>,
}

impl ActuationRequest {
    /// The targeted device.
    pub fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    /// Next progress update, or `None` once the activation is over.
    pub async fn next(&mut self) -> Option<ActuationUpdate> {
        self.updates.recv().await
    }

    /// Wait until the activation has finished.
    pub async fn wait(mut self) -> Result<()> {
        while let Some(update) = self.next().await {
            match update {
                ActuationUpdate::Started => {
                    debug!("{}: buzzing", self.identity.address);
                }
                ActuationUpdate::Stopped => return Ok(()),
                ActuationUpdate::Failed(e) => return Err(e),
            }
        }
        Err(Error::Cancelled)
    }
}

/// Executes activations against locator sessions.
#[derive(Clone)]
pub struct ActuationProtocol {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn Publisher>,
    run: RunFlag,
    shutdown: CancellationToken,
    config: ActuationConfig,
    tasks: TaskTracker,
}

impl std::fmt::Debug for ActuationProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuationProtocol")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ActuationProtocol {
    /// Create a protocol instance.
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        publisher: Arc<dyn Publisher>,
        run: RunFlag,
        shutdown: CancellationToken,
        config: ActuationConfig,
    ) -> Self {
        Self {
            transport,
            clock,
            publisher,
            run,
            shutdown,
            config,
            tasks: TaskTracker::new(),
        }
    }

    /// Wait for every activation in flight to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Start an activation.
    ///
    /// Fails synchronously, without touching the radio, if the driver is not
    /// running or if an activation is already in flight for this device.
    pub fn activate(&self, session: &Arc<Session>) -> Result<ActuationRequest> {
        if !self.run.is_running() {
            return Err(Error::NotRunning);
        }
        let guard = session
            .try_begin_actuation()
            .ok_or_else(|| Error::AlreadyInProgress {
                address: session.address().to_string(),
            })?;

        let (tx, rx) = mpsc::channel(2);
        let protocol = self.clone();
        self.tasks.spawn(async move { protocol.execute(guard, tx).await });

        Ok(ActuationRequest {
            identity: session.identity().clone(),
            updates: rx,
        })
    }

    async fn execute(self, guard: ActuationGuard, updates: mpsc::Sender<ActuationUpdate>) {
        let session = Arc::clone(guard.session());
        let address = session.address();

        if let Err(e) = self.ensure_connected(&session).await {
            warn!("{}: activation failed: {}", address, e);
            drop(guard);
            let _ = updates.send(ActuationUpdate::Failed(e)).await;
            return;
        }

        if let Err(e) = self.transport.send_command(address, &LOCATOR_ACTIVATE).await {
            warn!("{}: activate command failed: {}", address, e);
            drop(guard);
            let _ = updates.send(ActuationUpdate::Failed(e)).await;
            return;
        }
        info!("{}: locator activated", address);
        self.publisher
            .publish_locator_state(session.identity(), LocatorState::Started);
        let _ = updates.send(ActuationUpdate::Started).await;

        tokio::select! {
            _ = self.clock.sleep(self.config.activation_duration) => {}
            _ = self.shutdown.cancelled() => {
                debug!("{}: activation cut short by shutdown", address);
            }
        }

        if let Err(e) = self.transport.send_command(address, &LOCATOR_DEACTIVATE).await {
            warn!("{}: deactivate command failed: {}", address, e);
        }
        info!("{}: locator deactivated", address);
        self.publisher
            .publish_locator_state(session.identity(), LocatorState::Stopped);
        drop(guard);
        let _ = updates.send(ActuationUpdate::Stopped).await;
    }

    async fn ensure_connected(&self, session: &Session) -> Result<()> {
        let mut backoff = Backoff::new(self.config.retry.clone());

        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !self.run.is_running() {
                return Err(Error::NotRunning);
            }

            let attempt = session
                .establish(
                    self.transport.as_ref(),
                    self.config.connect_timeout,
                    self.clock.as_ref(),
                )
                .await;
            let e = match attempt {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            session.record_retry();
            match backoff.record_failure() {
                Some(delay) => {
                    warn!(
                        "{}: connect attempt {} failed ({}), retrying in {:?}",
                        session.address(),
                        backoff.attempts(),
                        e,
                        delay
                    );
                    self.clock.sleep(delay).await;
                }
                None => {
                    warn!(
                        "{}: giving up after {} connect attempts ({})",
                        session.address(),
                        backoff.attempts(),
                        e
                    );
                    return Err(Error::ConnectionExhausted {
                        address: session.address().to_string(),
                        attempts: backoff.attempts(),
                    });
                }
            }
        }
    }
}
