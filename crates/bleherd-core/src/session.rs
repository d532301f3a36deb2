//! Per-device session state.
//!
//! A [`Session`] exists for every peripheral that was ever seen and lives
//! until process shutdown. It owns the device's [`LinkState`], which only
//! changes through the pure transition function [`LinkState::on`], and is the
//! [`EventSink`] the transport reports completions to.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use bleherd_types::PeripheralIdentity;

use crate::clock::Clock;
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::Publisher;
use crate::transport::{EventSink, Transport};

/// Link state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No link. Initial state.
    #[default]
    Disconnected,
    /// A connect request is outstanding.
    Connecting,
    /// The link is up.
    Connected,
}

/// Something that happened to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    /// A connect attempt was issued.
    ConnectRequested,
    /// The transport reported the link up.
    ConnectSucceeded,
    /// The connect attempt failed or timed out.
    ConnectFailed,
    /// The link went down.
    LinkDropped,
}

impl LinkState {
    /// Pure transition function.
    ///
    /// Events that make no sense in the current state leave it unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use bleherd_core::{LinkEvent, LinkState};
    ///
    /// let state = LinkState::Disconnected.on(LinkEvent::ConnectRequested);
    /// assert_eq!(state, LinkState::Connecting);
    /// assert_eq!(state.on(LinkEvent::ConnectSucceeded), LinkState::Connected);
    /// assert_eq!(LinkState::Connected.on(LinkEvent::ConnectRequested), LinkState::Connected);
    /// ```
    #[must_use]
    pub fn on(self, event: LinkEvent) -> LinkState {
        use LinkEvent::*;
        use LinkState::*;

        match (self, event) {
            (Disconnected, ConnectRequested) => Connecting,
            (Connecting, ConnectSucceeded) => Connected,
            (Connecting, ConnectFailed) => Disconnected,
            (Connecting, LinkDropped) => Disconnected,
            (Connected, LinkDropped) => Disconnected,
            // The peripheral may reconnect on its own.
            (Disconnected, ConnectSucceeded) => Connected,
            (state, _) => state,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// A value pushed by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Attribute handle.
    pub attribute: u16,
    /// Raw payload.
    pub data: Vec<u8>,
}

/// Receiving half of a session's notification channel.
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

/// Process-wide "should sessions be doing work" flag.
///
/// Clearing it pauses every session at the top of its next iteration; they
/// resume when it is set again.
#[derive(Debug, Clone)]
pub struct RunFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl RunFlag {
    /// Create a flag in the given state.
    pub fn new(running: bool) -> Self {
        let (tx, _) = watch::channel(running);
        Self { tx: Arc::new(tx) }
    }

    /// Current value.
    pub fn is_running(&self) -> bool {
        *self.tx.borrow()
    }

    /// Change the value, waking waiters if it differs.
    pub fn set(&self, running: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != running;
            *current = running;
            changed
        });
    }

    /// Resolve once the flag is set.
    pub async fn wait_running(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|running| *running).await;
    }

    /// Resolve once the flag is cleared.
    pub async fn wait_stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Connection session for one peripheral.
pub struct Session {
    identity: PeripheralIdentity,
    link: watch::Sender<LinkState>,
    retry_count: AtomicU32,
    last_activity: Mutex<Option<Instant>>,
    actuating: AtomicBool,
    notifications: mpsc::UnboundedSender<Notification>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("link", &*self.link.borrow())
            .field("retry_count", &self.retry_count)
            .field("actuating", &self.actuating)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session and the receiving end of its notification channel.
    pub fn new(
        identity: PeripheralIdentity,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, NotificationReceiver) {
        let (link, _) = watch::channel(LinkState::Disconnected);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            identity,
            link,
            retry_count: AtomicU32::new(0),
            last_activity: Mutex::new(None),
            actuating: AtomicBool::new(false),
            notifications: tx,
            publisher,
            clock,
        });
        (session, rx)
    }

    /// The peripheral this session tracks.
    pub fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    /// Shorthand for the identity's address.
    pub fn address(&self) -> &str {
        &self.identity.address
    }

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Watch link state changes.
    pub fn subscribe_link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// Failed connect attempts since the last successful connection.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Count one more failed connect attempt.
    pub fn record_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// When the peripheral last said something.
    pub fn last_activity(&self) -> Option<Instant> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        let now = self.clock.now();
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now);
    }

    /// Feed an event through the transition function.
    ///
    /// Returns the resulting state. Changes are logged and published.
    pub fn apply(&self, event: LinkEvent) -> LinkState {
        self.transition(event, |_| true).0
    }

    /// Move the link from `Disconnected` to `Connecting`.
    ///
    /// Returns `true` only for the caller that made the move; that caller
    /// owns the connect request.
    pub fn claim_connect(&self) -> bool {
        self.transition(LinkEvent::ConnectRequested, |state| {
            state == LinkState::Disconnected
        })
        .1
    }

    /// Apply `event` if `allowed` accepts the current state, as one step.
    fn transition(
        &self,
        event: LinkEvent,
        allowed: impl FnOnce(LinkState) -> bool,
    ) -> (LinkState, bool) {
        let mut previous = LinkState::Disconnected;
        let mut current = LinkState::Disconnected;
        let changed = self.link.send_if_modified(|state| {
            previous = *state;
            if allowed(previous) {
                *state = previous.on(event);
            }
            current = *state;
            current != previous
        });

        if changed {
            info!(
                "{}: {} -> {} ({:?})",
                self.identity.address, previous, current, event
            );
            if current == LinkState::Connected {
                self.retry_count.store(0, Ordering::SeqCst);
            }
            self.publisher.publish_link_state(&self.identity, current);
        } else {
            debug!(
                "{}: {:?} ignored in state {}",
                self.identity.address, event, current
            );
        }
        (current, changed)
    }

    /// Try to bring the link up, waiting at most `timeout` for the transport.
    ///
    /// Returns immediately if already connected. A connect attempt that is
    /// already outstanding is waited on rather than duplicated.
    pub async fn establish(
        &self,
        transport: &dyn Transport,
        timeout: Duration,
        clock: &dyn Clock,
    ) -> Result<()> {
        let mut link = self.subscribe_link();

        if self.is_connected() {
            return Ok(());
        }
        if self.claim_connect() {
            debug!("{}: connecting", self.identity.address);
            if let Err(e) = transport
                .connect(&self.identity.address, self.identity.address_kind)
                .await
            {
                self.apply(LinkEvent::ConnectFailed);
                return Err(e);
            }
        } else {
            debug!("{}: connect already outstanding", self.identity.address);
        }

        tokio::select! {
            settled = link.wait_for(|state| *state != LinkState::Connecting) => {
                match settled.map(|state| *state) {
                    Ok(LinkState::Connected) => Ok(()),
                    Ok(_) => Err(Error::connection_failed(
                        Some(self.identity.address.clone()),
                        ConnectionFailureReason::Other("link dropped while connecting".to_string()),
                    )),
                    Err(_) => Err(Error::NotConnected),
                }
            }
            _ = clock.sleep(timeout) => {
                self.apply(LinkEvent::ConnectFailed);
                Err(Error::timeout(format!("connect {}", self.identity.address), timeout))
            }
        }
    }

    /// Claim the exclusive actuation slot.
    ///
    /// Returns `None` if an actuation is already running. The slot is
    /// released when the guard is dropped.
    pub fn try_begin_actuation(self: &Arc<Self>) -> Option<ActuationGuard> {
        self.actuating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ActuationGuard {
                session: Arc::clone(self),
            })
    }

    /// Whether an actuation holds the slot.
    pub fn is_actuating(&self) -> bool {
        self.actuating.load(Ordering::SeqCst)
    }
}

impl EventSink for Session {
    fn on_connected(&self) {
        self.touch();
        self.apply(LinkEvent::ConnectSucceeded);
    }

    fn on_disconnected(&self) {
        let event = if self.link_state() == LinkState::Connecting {
            LinkEvent::ConnectFailed
        } else {
            LinkEvent::LinkDropped
        };
        self.apply(event);
    }

    fn on_notification(&self, attribute: u16, data: &[u8]) {
        self.touch();
        let notification = Notification {
            attribute,
            data: data.to_vec(),
        };
        if self.notifications.send(notification).is_err() {
            debug!(
                "{}: notification on 0x{:04x} dropped, router gone",
                self.identity.address, attribute
            );
        }
    }
}

/// Holds a session's exclusive actuation slot. Releases it on drop.
#[derive(Debug)]
pub struct ActuationGuard {
    session: Arc<Session>,
}

impl ActuationGuard {
    /// The session whose slot is held.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ActuationGuard {
    fn drop(&mut self) {
        self.session.actuating.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::events::EventDispatcher;
    use crate::mock::MockTransport;
    use bleherd_types::{AddressKind, DeviceRole};
    use tokio::sync::Barrier;
    use tokio::task::JoinSet;

    fn session() -> (Arc<Session>, NotificationReceiver) {
        Session::new(
            PeripheralIdentity::new("AA:BB:CC:DD:EE:FF", AddressKind::Random, DeviceRole::LocatorTag),
            Arc::new(EventDispatcher::default()),
            Arc::new(TokioClock),
        )
    }

    #[test]
    fn test_transition_table() {
        use LinkEvent::*;
        use LinkState::*;

        let cases = [
            (Disconnected, ConnectRequested, Connecting),
            (Connecting, ConnectSucceeded, Connected),
            (Connecting, ConnectFailed, Disconnected),
            (Connecting, LinkDropped, Disconnected),
            (Connected, LinkDropped, Disconnected),
            (Disconnected, ConnectSucceeded, Connected),
            (Disconnected, ConnectFailed, Disconnected),
            (Disconnected, LinkDropped, Disconnected),
            (Connecting, ConnectRequested, Connecting),
            (Connected, ConnectRequested, Connected),
            (Connected, ConnectSucceeded, Connected),
            (Connected, ConnectFailed, Connected),
        ];
        for (from, event, to) in cases {
            assert_eq!(from.on(event), to, "{:?} + {:?}", from, event);
        }
    }

    #[tokio::test]
    async fn test_retry_count_resets_on_connect() {
        let (session, _rx) = session();
        session.record_retry();
        session.record_retry();
        assert_eq!(session.retry_count(), 2);

        session.on_connected();
        assert!(session.is_connected());
        assert_eq!(session.retry_count(), 0);
        assert!(session.last_activity().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_is_connect_failure() {
        let (session, _rx) = session();
        session.apply(LinkEvent::ConnectRequested);
        session.on_disconnected();
        assert_eq!(session.link_state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_only_one_caller_claims_connect() {
        let (session, _rx) = session();
        assert!(session.claim_connect());
        assert!(!session.claim_connect());
        assert_eq!(session.link_state(), LinkState::Connecting);

        session.on_connected();
        assert!(!session.claim_connect());
        assert_eq!(session.link_state(), LinkState::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_establish_connects_once() {
        for _ in 0..50 {
            let (session, _rx) = session();
            let mock = Arc::new(MockTransport::new());
            mock.register_sink(session.address(), session.clone());

            let barrier = Arc::new(Barrier::new(4));
            let mut tasks = JoinSet::new();
            for _ in 0..4 {
                let session = session.clone();
                let mock = mock.clone();
                let barrier = barrier.clone();
                tasks.spawn(async move {
                    barrier.wait().await;
                    session
                        .establish(mock.as_ref(), Duration::from_secs(10), &TokioClock)
                        .await
                });
            }
            while let Some(result) = tasks.join_next().await {
                result.unwrap().unwrap();
            }

            assert!(session.is_connected());
            assert_eq!(mock.connect_count(session.address()), 1);
        }
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded_in_order() {
        let (session, mut rx) = session();
        session.on_notification(37, &[1, 0]);
        session.on_notification(53, &[2, 0]);
        assert_eq!(rx.recv().await.unwrap().attribute, 37);
        assert_eq!(rx.recv().await.unwrap().attribute, 53);
    }

    #[tokio::test]
    async fn test_actuation_guard_is_exclusive() {
        let (session, _rx) = session();
        let guard = session.try_begin_actuation().unwrap();
        assert!(session.is_actuating());
        assert!(session.try_begin_actuation().is_none());
        drop(guard);
        assert!(!session.is_actuating());
        assert!(session.try_begin_actuation().is_some());
    }

    #[tokio::test]
    async fn test_run_flag() {
        let flag = RunFlag::new(false);
        assert!(!flag.is_running());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait_running().await })
        };
        flag.set(true);
        waiter.await.unwrap();
        assert!(flag.is_running());

        flag.set(false);
        flag.wait_stopped().await;
    }
}
