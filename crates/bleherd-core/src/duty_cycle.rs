//! Duty-cycled sampling for telemetry sensors.
//!
//! While connected, a plant sensor is driven through a repeating cycle:
//!
//! 1. subscribe to the three telemetry ranges (once per connection)
//! 2. enable live streaming
//! 3. hold the sample window while notifications arrive
//! 4. disable live streaming
//! 5. hold the sleep window
//!
//! Streaming drains the sensor's battery, so the sample window is short
//! and the sleep window long.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bleherd_types::handles::{DISABLE_LIVE_MODE, ENABLE_LIVE_MODE, TELEMETRY_RANGES};

use crate::clock::Clock;
use crate::session::{LinkState, RunFlag, Session};
use crate::transport::{NotifyRange, Transport};

/// Default length of the streaming window.
pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_secs(5);

/// Default pause between streaming windows.
pub const DEFAULT_SLEEP_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Why a duty cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleExit {
    /// The link went down. No disable command was sent.
    LinkLost,
    /// The run flag was cleared or shutdown was requested.
    Stopped,
}

/// Drives the sample/sleep cycle of one telemetry session.
#[derive(Clone)]
pub struct DutyCycleScheduler {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    sample_window: Duration,
    sleep_window: Duration,
}

impl std::fmt::Debug for DutyCycleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DutyCycleScheduler")
            .field("sample_window", &self.sample_window)
            .field("sleep_window", &self.sleep_window)
            .finish_non_exhaustive()
    }
}

impl DutyCycleScheduler {
    /// Create a scheduler.
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        sample_window: Duration,
        sleep_window: Duration,
    ) -> Self {
        Self {
            transport,
            clock,
            sample_window,
            sleep_window,
        }
    }

    /// Run cycles until the link drops, the run flag clears or shutdown.
    pub async fn run(
        &self,
        session: &Session,
        run: &RunFlag,
        shutdown: &CancellationToken,
    ) -> CycleExit {
        let address = session.address();
        let mut link = session.subscribe_link();

        if !session.is_connected() {
            return CycleExit::LinkLost;
        }
        self.subscribe(address).await;

        loop {
            if shutdown.is_cancelled() || !run.is_running() {
                return CycleExit::Stopped;
            }
            if !session.is_connected() {
                return CycleExit::LinkLost;
            }

            self.send(address, &ENABLE_LIVE_MODE, "enable live mode").await;

            let lost_in_window = tokio::select! {
                _ = self.clock.sleep(self.sample_window) => false,
                _ = link_lost(&mut link) => true,
                // Cut the window short but still switch streaming off.
                _ = shutdown.cancelled() => false,
            };
            if lost_in_window {
                info!("{}: link lost during sample window", address);
                return CycleExit::LinkLost;
            }

            self.send(address, &DISABLE_LIVE_MODE, "disable live mode").await;
            if shutdown.is_cancelled() {
                return CycleExit::Stopped;
            }

            debug!("{}: sleeping for {:?}", address, self.sleep_window);
            let exit = tokio::select! {
                _ = self.clock.sleep(self.sleep_window) => None,
                _ = link_lost(&mut link) => Some(CycleExit::LinkLost),
                _ = shutdown.cancelled() => Some(CycleExit::Stopped),
                _ = run.wait_stopped() => Some(CycleExit::Stopped),
            };
            if let Some(exit) = exit {
                debug!("{}: sleep window ended early ({:?})", address, exit);
                return exit;
            }
        }
    }

    async fn subscribe(&self, address: &str) {
        for range in TELEMETRY_RANGES {
            if let Err(e) = self
                .transport
                .notify(address, NotifyRange::subscribe(range))
                .await
            {
                warn!(
                    "{}: subscribing to handles {}..={} failed: {}",
                    address, range.start, range.end, e
                );
            }
        }
    }

    async fn send(&self, address: &str, payload: &[u8], what: &str) {
        debug!("{}: {}", address, what);
        if let Err(e) = self.transport.send_command(address, payload).await {
            warn!("{}: {} failed: {}", address, what, e);
        }
    }
}

async fn link_lost(link: &mut watch::Receiver<LinkState>) {
    let _ = link.wait_for(|state| *state != LinkState::Connected).await;
}
