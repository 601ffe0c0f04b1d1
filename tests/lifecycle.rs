//! Network lifecycle: init, re-init, cancellation, teardown

mod common;

use common::{addresses, workout, Harness};
use notchnet_core::core::device::CommandKind;
use notchnet_core::{LinkError, NotchError, ServiceEvent, SessionState, SimulatedDevice};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn two_lowest_of_three_are_bound_repeatably() {
    for _ in 0..3 {
        let h = Harness::new(&["C3", "C1", "C2"]);
        let network = h.ready(2).await;
        assert_eq!(network.addresses(), addresses(&["C1", "C2"]));
        assert_eq!(h.service.state(), SessionState::Ready);
        assert_eq!(h.device("C3").command_count(CommandKind::Connect), 0);
    }
}

#[tokio::test]
async fn reinit_with_same_devices_bumps_generation_without_io() {
    let h = Harness::new(&["01", "02"]);
    let first = h.ready(2).await;
    let connects = h.count(CommandKind::Connect);

    let second = h.ready(2).await;
    assert_eq!(second.generation(), first.generation() + 1);
    assert_eq!(second.addresses(), first.addresses());
    assert_eq!(h.count(CommandKind::Connect), connects);
    assert_eq!(h.count(CommandKind::Disconnect), 0);
}

#[tokio::test]
async fn incompatible_init_restores_previous_state() {
    let h = Harness::new(&["01", "02"]);
    let network = h.ready(2).await;

    let err = assert_err!(h.service.init(workout(3)).result().await);
    match err {
        NotchError::Compatibility(e) => {
            assert_eq!(e.required, 3);
            assert_eq!(e.available, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.service.state(), SessionState::Ready);
    let current = h.service.get_network().expect("network kept");
    assert_eq!(current.generation(), network.generation());
}

#[tokio::test]
async fn concurrent_init_is_rejected() {
    let h = Harness::new(&["01", "02"]);
    h.device("01").delay_on(CommandKind::Connect, Duration::from_millis(50));

    let first = h.service.init(workout(2));
    let second = h.service.init(workout(2)).wait().await;
    assert!(matches!(
        second.error(),
        Some(NotchError::OperationInProgress { .. })
    ));
    assert_ok!(first.result().await);
}

#[tokio::test(start_paused = true)]
async fn cancelled_init_leaves_error_until_teardown() {
    let h = Harness::new(&["01", "02"]);
    h.device("02").delay_on(CommandKind::Connect, Duration::from_millis(500));

    let init = h.service.init(workout(2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(init.cancel());
    assert!(init.wait().await.is_cancelled());

    assert_eq!(h.service.state(), SessionState::Error);
    assert!(h.service.get_network().is_none());
    assert_eq!(h.service.stranded(), addresses(&["01", "02"]));

    let err = assert_err!(h.service.configure_capture(false).result().await);
    assert!(matches!(err, NotchError::InvalidState { current: SessionState::Error, .. }));

    assert_ok!(h.service.disconnect().result().await);
    assert_eq!(h.service.state(), SessionState::Uninitialized);
    assert!(h.service.stranded().is_empty());
}

#[tokio::test]
async fn connect_failure_strands_the_new_network() {
    let h = Harness::new(&["01", "02", "03"]);
    h.device("02")
        .fail_on(CommandKind::Connect, LinkError::Timeout(100));

    let err = assert_err!(h.service.init(workout(3)).result().await);
    assert_eq!(err.failed_devices(), addresses(&["02"]));
    assert_eq!(h.service.state(), SessionState::Error);
    assert_eq!(h.service.stranded(), addresses(&["01", "02", "03"]));

    // 02 never connected, so it cannot be powered off remotely
    let err = assert_err!(h.service.shut_down().result().await);
    assert_eq!(err.failed_devices(), addresses(&["02"]));
    assert_eq!(h.service.stranded(), addresses(&["02"]));
    assert!(!h.device("01").is_powered());
    assert!(!h.device("03").is_powered());

    h.device("02").clear_failures();
    assert_ok!(h.service.disconnect().result().await);
    assert_eq!(h.service.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn init_from_error_recovers() {
    let h = Harness::new(&["01", "02"]);
    h.device("01").fail_on(CommandKind::Connect, LinkError::Disconnected);
    assert_err!(h.service.init(workout(2)).result().await);
    assert_eq!(h.service.state(), SessionState::Error);

    h.device("01").clear_failures();
    let network = h.ready(2).await;
    assert_eq!(network.len(), 2);
    assert_eq!(h.service.state(), SessionState::Ready);
    assert!(h.service.stranded().is_empty());
}

#[tokio::test]
async fn disconnect_releases_the_network() {
    let h = Harness::new(&["01", "02"]);
    let network = h.ready(2).await;
    let mut events = h.service.subscribe();

    assert_ok!(h.service.disconnect().result().await);
    assert_eq!(h.service.state(), SessionState::Uninitialized);
    assert!(h.service.get_network().is_none());
    assert!(!h.device("01").is_connected());

    let mut released = None;
    while let Ok(event) = events.try_recv() {
        if let ServiceEvent::NetworkReleased { generation } = event {
            released = Some(generation);
        }
    }
    assert_eq!(released, Some(network.generation()));
}

#[tokio::test]
async fn disconnect_failure_strands_only_failing_devices() {
    let h = Harness::new(&["01", "02", "03"]);
    h.ready(3).await;
    h.device("02")
        .fail_on(CommandKind::Disconnect, LinkError::Rejected("busy".into()));

    let err = assert_err!(h.service.disconnect().result().await);
    assert_eq!(err.failed_devices(), addresses(&["02"]));
    assert_eq!(h.service.state(), SessionState::Error);
    assert_eq!(h.service.stranded(), addresses(&["02"]));

    h.device("02").clear_failures();
    h.device("01").clear_log();
    assert_ok!(h.service.disconnect().result().await);
    assert_eq!(h.service.state(), SessionState::Uninitialized);
    assert!(h.device("01").commands().is_empty());
}

#[tokio::test]
async fn unchecked_init_binds_responders() {
    let h = Harness::new(&["01", "02", "03"]);
    h.device("03").fail_on(CommandKind::Connect, LinkError::Timeout(50));

    let network = assert_ok!(h.service.unchecked_init().result().await);
    assert_eq!(network.addresses(), addresses(&["01", "02"]));
    assert_eq!(network.workout().device_count(), 2);
    assert_eq!(h.service.state(), SessionState::Ready);
}

#[tokio::test]
async fn init_emits_transitions_in_order() {
    let h = Harness::new(&["01"]);
    let mut events = h.service.subscribe();
    h.ready(1).await;

    let mut states = Vec::new();
    let mut bound = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ServiceEvent::StateChanged(t) => states.push((t.from, t.to)),
            ServiceEvent::NetworkBound { generation, .. } => bound = generation == 1,
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            (SessionState::Uninitialized, SessionState::Scanning),
            (SessionState::Scanning, SessionState::Initializing),
            (SessionState::Initializing, SessionState::Ready),
        ]
    );
    assert!(bound);
    assert_eq!(h.service.history().len(), 3);
}

#[tokio::test]
async fn scan_for_new_skips_excluded_devices() {
    let h = Harness::new(&["01", "02"]);
    let network = h.ready(2).await;

    let err = assert_err!(h.service.scan_for_new(network.addresses()).result().await);
    assert!(matches!(err, NotchError::NoDeviceFound(200)));
    assert_eq!(h.service.state(), SessionState::Ready);
}

#[tokio::test]
async fn scan_for_new_returns_seen_but_not_excluded_device() {
    let h = Harness::new(&["01", "02"]);
    assert_ok!(h.service.scan().result().await);

    let device = assert_ok!(h.service.scan_for_new(addresses(&["01"])).result().await);
    assert_eq!(device.address.as_str(), "02");
}

#[tokio::test]
async fn compatible_network_is_kept_when_lower_address_appears() {
    let h = Harness::new(&["02", "03"]);
    let first = h.ready(2).await;
    assert_eq!(first.addresses(), addresses(&["02", "03"]));
    h.discovery.add(SimulatedDevice::standard("01"));

    let second = h.ready(2).await;
    assert_eq!(second.addresses(), addresses(&["02", "03"]));
    assert_eq!(second.generation(), first.generation() + 1);
    assert_eq!(h.count(CommandKind::Disconnect), 0);
    assert_eq!(h.device("01").command_count(CommandKind::Connect), 0);
}

#[tokio::test]
async fn init_after_shut_down_skips_powered_off_devices() {
    let h = Harness::new(&["01", "02", "03"]);
    let first = h.ready(1).await;
    assert_eq!(first.addresses(), addresses(&["01"]));

    assert_ok!(h.service.shut_down().result().await);
    assert!(!h.device("01").is_powered());

    let second = h.ready(1).await;
    assert_eq!(second.addresses(), addresses(&["02"]));
    assert_eq!(h.service.state(), SessionState::Ready);
}

#[tokio::test]
async fn incompatible_network_is_rebuilt_from_discovery() {
    let h = Harness::new(&["01", "02", "03"]);
    h.ready(2).await;

    let network = h.ready(3).await;
    assert_eq!(network.addresses(), addresses(&["01", "02", "03"]));
    assert_eq!(h.device("01").command_count(CommandKind::Disconnect), 1);
    assert!(h.device("03").is_connected());
}

#[tokio::test]
async fn discovery_failure_keeps_state() {
    let h = Harness::new(&["01"]);
    h.discovery.set_failure(Some(LinkError::Io("radio off".into())));

    let err = assert_err!(h.service.init(workout(1)).result().await);
    assert!(matches!(err, NotchError::Discovery(_)));
    assert_eq!(h.service.state(), SessionState::Uninitialized);
}
