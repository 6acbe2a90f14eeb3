//! OPO link against the mock controller over real TCP.

mod common;

use common::MockController;
use opo_daq::opo::{ConnectionState, ErrorCode, LinkOptions, MotorStatus, OpoEvent, OpoLink};
use opo_daq::OpoError;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn options(port: u16) -> LinkOptions {
    LinkOptions {
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout: Duration::from_secs(1),
        response_timeout: Duration::from_millis(500),
        motor_poll_interval: Duration::from_millis(10),
        motor_stop_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn connected(controller: &MockController) -> OpoLink {
    let link = OpoLink::new(options(controller.port()));
    link.connect().await.unwrap();
    link
}

async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<OpoEvent>,
    wanted: OpoEvent,
) {
    timeout(Duration::from_secs(1), async {
        loop {
            if events.recv().await.unwrap() == wanted {
                return;
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_connect_and_query() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = connected(&controller).await;

    assert_eq!(link.connection_state(), ConnectionState::Connected);
    assert_eq!(link.read_motor_status().await.unwrap(), MotorStatus::Idle);
    assert_eq!(link.read_wavelength().await.unwrap(), 750.0);
    assert_eq!(link.last_wavelength(), Some(750.0));
}

#[tokio::test]
async fn test_move_and_settle_polls_until_idle() {
    let controller = MockController::start(Duration::from_millis(60), 0.0).await;
    let link = connected(&controller).await;

    link.move_and_settle(765.4321, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(link.motor_status(), MotorStatus::Idle);
    assert_eq!(link.last_wavelength(), Some(765.432));

    let received = controller.received();
    assert_eq!(received[0], "GOTO 765.432");
    let polls = received.iter().filter(|l| *l == "TELLSTAT").count();
    assert!(polls >= 2, "expected repeated TELLSTAT polls, got {:?}", received);
    assert_eq!(received.last().map(String::as_str), Some("TELLWL"));
}

#[tokio::test]
async fn test_out_of_range_move_never_reaches_controller() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = connected(&controller).await;

    let err = link.move_to(900.0).await.unwrap_err();
    assert!(matches!(err, OpoError::Validation(_)));
    let err = link.move_to(709.99).await.unwrap_err();
    assert!(err.is_local_rejection());

    // Round-trip something so every earlier byte has been processed
    link.read_wavelength().await.unwrap();
    assert!(controller.received().iter().all(|l| !l.starts_with("GOTO")));
}

#[tokio::test]
async fn test_rejected_speed_is_reported_and_link_survives() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = connected(&controller).await;
    let mut events = link.subscribe();

    link.set_speed(10.0).await.unwrap();
    wait_for_event(
        &mut events,
        OpoEvent::ErrorReceived(ErrorCode::VelocityOutOfRange),
    )
    .await;

    link.set_speed(2.0).await.unwrap();
    wait_for_event(&mut events, OpoEvent::ErrorReceived(ErrorCode::Success)).await;

    assert_eq!(link.connection_state(), ConnectionState::Connected);
    assert_eq!(link.read_wavelength().await.unwrap(), 750.0);
    assert_eq!(
        controller.received(),
        vec!["SETSPD 10.000", "SETSPD 2.000", "TELLWL"]
    );
}

#[tokio::test]
async fn test_confirmed_speed_reply_does_not_leak_into_move() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = connected(&controller).await;

    let err = link.apply_speed(10.0).await.unwrap_err();
    assert!(matches!(
        err,
        OpoError::Protocol {
            code: ErrorCode::VelocityOutOfRange
        }
    ));

    // Moving straight after a rejected speed must not see the stale fault
    link.move_and_settle(770.0, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(link.last_wavelength(), Some(770.0));
    assert_eq!(controller.received()[..2], ["SETSPD 10.000", "GOTO 770.000"]);
}

#[tokio::test]
async fn test_controller_busy_fault_aborts_move() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = connected(&controller).await;
    controller.set_moving(true);

    let err = link
        .move_and_settle(760.0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OpoError::Protocol {
            code: ErrorCode::GotoAlreadyActive
        }
    ));
    assert_eq!(err.kind(), "protocol");

    // Resync saw the controller's real status
    assert_eq!(link.motor_status(), MotorStatus::Moving);
    controller.set_moving(false);
    assert_eq!(link.read_motor_status().await.unwrap(), MotorStatus::Idle);
    link.move_and_settle(760.0, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(link.last_wavelength(), Some(760.0));
}

#[tokio::test]
async fn test_motor_that_never_stops_times_out() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = OpoLink::new(LinkOptions {
        motor_stop_timeout: Duration::from_millis(150),
        ..options(controller.port())
    });
    link.connect().await.unwrap();
    controller.set_moving(true);

    let err = link
        .wait_for_motor_stop(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OpoError::Timeout(_, "motor stop")));
    assert_eq!(link.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_unsolicited_lines_are_classified() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = connected(&controller).await;
    // A round trip guarantees the controller has registered this client
    link.read_wavelength().await.unwrap();
    let mut events = link.subscribe();

    controller.push_line("client connected");
    controller.push_line("7");
    wait_for_event(&mut events, OpoEvent::ErrorReceived(ErrorCode::NoVoltmeter)).await;

    controller.push_line("0x0\r\n812.50000");
    wait_for_event(&mut events, OpoEvent::MotorStopped).await;
    wait_for_event(&mut events, OpoEvent::WavelengthUpdated(812.5)).await;
    assert_eq!(link.last_wavelength(), Some(812.5));
}

#[tokio::test]
async fn test_disconnect_is_reported_and_reconnect_is_explicit() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = connected(&controller).await;
    link.read_wavelength().await.unwrap();
    let mut events = link.subscribe();

    controller.drop_clients();
    wait_for_event(&mut events, OpoEvent::Disconnected).await;
    assert_eq!(link.connection_state(), ConnectionState::Disconnected);

    let err = link.query_wavelength().await.unwrap_err();
    assert!(err.is_connection_loss());

    link.connect().await.unwrap();
    assert_eq!(link.read_wavelength().await.unwrap(), 750.0);
}

#[tokio::test]
async fn test_close_command_stops_listener() {
    let controller = MockController::start(Duration::from_millis(30), 0.0).await;
    let link = connected(&controller).await;

    link.close_server().await.unwrap();
    timeout(Duration::from_secs(1), async {
        while !controller.is_shut_down() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Give the accept loop a moment to drop the listener
    tokio::time::sleep(Duration::from_millis(50)).await;
    let other = OpoLink::new(options(controller.port()));
    let err = other.connect().await.unwrap_err();
    assert!(matches!(err, OpoError::Connection(_)));
}

#[tokio::test]
async fn test_connect_to_nothing_fails_cleanly() {
    // Bind and release a port so nothing is listening on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let link = OpoLink::new(options(port));
    let err = link.connect().await.unwrap_err();
    assert!(err.is_connection_loss());
    assert_eq!(link.connection_state(), ConnectionState::Disconnected);
}
