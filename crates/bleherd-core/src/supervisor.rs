//! The per-device control loop.
//!
//! Each tracked session gets one supervisor task. It keeps the link up with
//! unbounded passive reconnects and, once connected, hands the session to
//! the duty-cycle scheduler (telemetry sensors) or idles until the link
//! drops (locator tags, which are only driven by actuation requests).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bleherd_types::DeviceRole;

use crate::clock::Clock;
use crate::duty_cycle::{CycleExit, DutyCycleScheduler};
use crate::retry::{Backoff, RetryPolicy};
use crate::session::{LinkState, RunFlag, Session};
use crate::transport::Transport;

/// Supervises one session until shutdown.
pub struct SessionSupervisor {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    scheduler: DutyCycleScheduler,
    reconnect: RetryPolicy,
    connect_timeout: Duration,
    run: RunFlag,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("session", &self.session)
            .field("reconnect", &self.reconnect)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionSupervisor {
    /// Create a supervisor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        scheduler: DutyCycleScheduler,
        reconnect: RetryPolicy,
        connect_timeout: Duration,
        run: RunFlag,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            session,
            transport,
            clock,
            scheduler,
            reconnect,
            connect_timeout,
            run,
            shutdown,
        }
    }

    /// Run until shutdown.
    pub async fn run(self) {
        let address = self.session.address().to_string();
        let mut backoff = Backoff::new(self.reconnect.clone());
        debug!("{}: supervisor started", address);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if !self.run.is_running() {
                debug!("{}: paused", address);
                tokio::select! {
                    _ = self.run.wait_running() => continue,
                    _ = self.shutdown.cancelled() => break,
                }
            }

            if self.session.link_state() != LinkState::Connected {
                let attempt = tokio::select! {
                    result = self.session.establish(
                        self.transport.as_ref(),
                        self.connect_timeout,
                        self.clock.as_ref(),
                    ) => result,
                    _ = self.shutdown.cancelled() => break,
                };

                if let Err(e) = attempt {
                    let retries = self.session.record_retry();
                    let Some(delay) = backoff.record_failure() else {
                        warn!("{}: reconnect policy exhausted after {} attempts", address, retries);
                        break;
                    };
                    warn!(
                        "{}: connect attempt {} failed ({}), retrying in {:?}",
                        address, retries, e, delay
                    );
                    tokio::select! {
                        _ = self.clock.sleep(delay) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                    continue;
                }
            }

            backoff.reset();
            self.connected().await;
        }

        debug!("{}: supervisor stopped", address);
    }

    async fn connected(&self) {
        let address = self.session.address();
        match self.session.identity().role {
            DeviceRole::TelemetrySensor => {
                match self
                    .scheduler
                    .run(&self.session, &self.run, &self.shutdown)
                    .await
                {
                    CycleExit::LinkLost => info!("{}: reconnecting", address),
                    CycleExit::Stopped => debug!("{}: duty cycle stopped", address),
                }
            }
            DeviceRole::LocatorTag => {
                let mut link = self.session.subscribe_link();
                tokio::select! {
                    _ = link.wait_for(|state| *state != LinkState::Connected) => {
                        info!("{}: reconnecting", address);
                    }
                    _ = self.run.wait_stopped() => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }
    }
}
