//! Locator tag activation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bleherd_core::mock::{ConnectBehavior, MockOp};
use bleherd_core::{
    ActuationConfig, ActuationProtocol, ActuationUpdate, DeviceEvent, Error, EventDispatcher,
    LinkState, MockTransport, RunFlag, Session, TokioClock, Transport,
};
use bleherd_types::handles::{LOCATOR_ACTIVATE, LOCATOR_DEACTIVATE};
use bleherd_types::{AddressKind, DeviceRole, LocatorState, PeripheralIdentity};

use common::{TAG, next_matching, settle, started, tag_advertisement};

/// A protocol and a session that no supervisor touches.
fn standalone(mock: &Arc<MockTransport>) -> (ActuationProtocol, Arc<Session>, EventDispatcher) {
    let dispatcher = EventDispatcher::default();
    let identity = PeripheralIdentity::new(TAG, AddressKind::Random, DeviceRole::LocatorTag);
    let (session, _notifications) =
        Session::new(identity, Arc::new(dispatcher.clone()), Arc::new(TokioClock));
    mock.register_sink(TAG, session.clone());

    let protocol = ActuationProtocol::new(
        mock.clone(),
        Arc::new(TokioClock),
        Arc::new(dispatcher.clone()),
        RunFlag::new(true),
        CancellationToken::new(),
        ActuationConfig::default(),
    );
    (protocol, session, dispatcher)
}

#[tokio::test(start_paused = true)]
async fn test_identify_buzzes_for_five_seconds() {
    let mock = Arc::new(MockTransport::new());
    let driver = started(&mock, tag_advertisement()).await;
    let mut events = driver.events();
    assert_eq!(
        driver.session(TAG).await.unwrap().link_state(),
        LinkState::Connected
    );

    let start = Instant::now();
    driver.identify(TAG).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert_eq!(
        mock.commands(TAG),
        vec![LOCATOR_ACTIVATE.to_vec(), LOCATOR_DEACTIVATE.to_vec()]
    );

    let mut states = Vec::new();
    while states.len() < 2 {
        states.push(
            next_matching(&mut events, |event| match event {
                DeviceEvent::LocatorState { state, .. } => Some(state),
                _ => None,
            })
            .await,
        );
    }
    assert_eq!(states, vec![LocatorState::Started, LocatorState::Stopped]);
}

#[tokio::test(start_paused = true)]
async fn test_second_activation_is_rejected() {
    let mock = Arc::new(MockTransport::new());
    let driver = started(&mock, tag_advertisement()).await;

    let mut first = driver.activate(TAG).await.unwrap();
    let second = driver.activate(TAG).await;
    assert!(matches!(second, Err(Error::AlreadyInProgress { .. })));

    assert!(matches!(first.next().await, Some(ActuationUpdate::Started)));
    assert!(matches!(
        driver.activate(TAG).await,
        Err(Error::AlreadyInProgress { .. })
    ));
    assert!(matches!(first.next().await, Some(ActuationUpdate::Stopped)));

    // Rejected requests never reached the radio.
    assert_eq!(mock.commands(TAG).len(), 2);

    // The slot is free once the first activation is over.
    driver.activate(TAG).await.unwrap().wait().await.unwrap();
    assert_eq!(mock.commands(TAG).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_not_running_is_rejected_before_any_radio_operation() {
    let mock = Arc::new(MockTransport::new());
    let driver = common::driver(&mock);
    driver.handle_advertisement(tag_advertisement()).await.unwrap();
    settle().await;

    let err = driver.activate(TAG).await.unwrap_err();
    assert!(matches!(err, Error::NotRunning));
    assert!(mock.ops_for(TAG).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_activation_after_stop_is_rejected() {
    let mock = Arc::new(MockTransport::new());
    let driver = started(&mock, tag_advertisement()).await;
    driver.stop();
    mock.clear_ops();

    assert!(matches!(driver.activate(TAG).await, Err(Error::NotRunning)));
    assert!(mock.ops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_activation_targets_locators_only() {
    let mock = Arc::new(MockTransport::new());
    let driver = started(&mock, common::sensor_advertisement()).await;

    assert!(matches!(
        driver.activate(common::SENSOR).await,
        Err(Error::UnsupportedRole {
            role: DeviceRole::TelemetrySensor,
            ..
        })
    ));
    assert!(matches!(
        driver.activate("00:00:00:00:00:01").await,
        Err(Error::DeviceNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_connects_exhaust_after_three_attempts() {
    let mock = Arc::new(MockTransport::with_connect_behavior(ConnectBehavior::Reject));
    let (protocol, session, _events) = standalone(&mock);

    let start = Instant::now();
    let err = protocol.activate(&session).unwrap().wait().await.unwrap_err();

    assert!(matches!(
        err,
        Error::ConnectionExhausted { attempts: 3, .. }
    ));
    assert_eq!(mock.connect_count(TAG), 3);
    // Two fixed 2 s pauses between three attempts.
    assert_eq!(start.elapsed(), Duration::from_secs(4));
    assert!(mock.commands(TAG).is_empty());
    assert!(!session.is_actuating());
    assert_eq!(session.link_state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connects_exhaust_too() {
    let mock = Arc::new(MockTransport::with_connect_behavior(ConnectBehavior::Fail));
    let (protocol, session, _events) = standalone(&mock);

    let err = protocol.activate(&session).unwrap().wait().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionExhausted { .. }));
    assert_eq!(mock.connect_count(TAG), 3);
    assert_eq!(session.retry_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_connects_time_out() {
    let mock = Arc::new(MockTransport::with_connect_behavior(ConnectBehavior::Hang));
    let (protocol, session, _events) = standalone(&mock);

    let start = Instant::now();
    let err = protocol.activate(&session).unwrap().wait().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionExhausted { attempts: 3, .. }));
    assert_eq!(start.elapsed(), Duration::from_secs(3 * 10 + 2 * 2));
}

#[tokio::test(start_paused = true)]
async fn test_connects_on_demand_after_a_retry() {
    let mock = Arc::new(MockTransport::new());
    mock.script_connects([ConnectBehavior::Reject]);
    let (protocol, session, events) = standalone(&mock);
    let mut events = events.subscribe();

    let mut request = protocol.activate(&session).unwrap();
    assert!(matches!(request.next().await, Some(ActuationUpdate::Started)));
    assert_eq!(mock.connect_count(TAG), 2);
    assert_eq!(session.link_state(), LinkState::Connected);
    assert_eq!(session.retry_count(), 0);

    request.wait().await.unwrap();
    let started = next_matching(&mut events, |event| match event {
        DeviceEvent::LocatorState { device, state } => Some((device, state)),
        _ => None,
    })
    .await;
    assert_eq!(started.0.address, TAG);
    assert_eq!(started.1, LocatorState::Started);
}

#[tokio::test(start_paused = true)]
async fn test_failed_activate_command_reports_failure() {
    let mock = Arc::new(MockTransport::new());
    let (protocol, session, _events) = standalone(&mock);
    mock.connect(TAG, AddressKind::Random).await.unwrap();
    mock.set_fail_commands(true);

    let err = protocol.activate(&session).unwrap().wait().await.unwrap_err();
    assert!(matches!(err, Error::WriteFailed { handle: 0x1b, .. }));
    assert_eq!(mock.commands(TAG), vec![LOCATOR_ACTIVATE.to_vec()]);
    assert!(!session.is_actuating());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cuts_activation_short() {
    let mock = Arc::new(MockTransport::new());
    let driver = started(&mock, tag_advertisement()).await;

    let request = driver.activate(TAG).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    driver.shutdown().await;

    request.wait().await.unwrap();
    assert_eq!(
        mock.commands(TAG),
        vec![LOCATOR_ACTIVATE.to_vec(), LOCATOR_DEACTIVATE.to_vec()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_deactivates_before_disconnecting() {
    let mock = Arc::new(MockTransport::new());
    let driver = started(&mock, tag_advertisement()).await;

    let mut request = driver.activate(TAG).await.unwrap();
    assert!(matches!(request.next().await, Some(ActuationUpdate::Started)));
    driver.shutdown().await;

    let ops = mock.ops_for(TAG);
    let deactivated = ops
        .iter()
        .position(|op| {
            matches!(op, MockOp::Command { payload, .. } if payload[..] == LOCATOR_DEACTIVATE)
        })
        .expect("deactivate was not sent");
    let disconnected = ops
        .iter()
        .position(|op| matches!(op, MockOp::Disconnect { .. }))
        .expect("tag was not disconnected");
    assert!(deactivated < disconnected);
    assert!(matches!(request.next().await, Some(ActuationUpdate::Stopped)));
}
