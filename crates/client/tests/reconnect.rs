mod common;

use std::time::Duration;

use cinebudget_client::{Notice, ReadyState};
use cinebudget_shared::SyncError;
use common::*;

#[tokio::test(start_paused = true)]
async fn backoff_sequence_then_connection_lost() {
    let mut h = Harness::new();
    let mut notices = h.sync.notices();
    h.sync.connect("42").await.unwrap();

    h.connector.set_fallback(Outcome::Refuse);
    h.connector.server(0).drop_connection();

    h.connector.wait_for_attempts(6).await;
    assert_eq!(notices.recv().await.unwrap(), Notice::ConnectionLost);
    assert_eq!(
        h.connector.attempt_gaps_ms(),
        vec![2000, 4000, 8000, 16000, 30000]
    );

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.connector.attempts(), 6);
    assert_eq!(h.sync.ready_state(), ReadyState::Closed);
    assert_eq!(h.sync.reconnect_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_attempts() {
    let mut h = Harness::new();
    h.sync.connect("42").await.unwrap();

    h.connector.server(0).drop_connection();
    h.connector.wait_for_attempts(2).await;
    h.wait_for_state(ReadyState::Open).await;
    assert_eq!(h.sync.reconnect_attempts(), 0);

    h.connector.server(1).drop_connection();
    h.connector.wait_for_attempts(3).await;

    assert_eq!(h.connector.attempt_gaps_ms(), vec![2000, 2000]);
}

#[tokio::test(start_paused = true)]
async fn failed_first_attempt_reports_transport_error_and_retries() {
    let connector = MockConnector::scripted(vec![Outcome::Refuse], Outcome::Accept);
    let mut h = Harness::with_connector(connector);

    let err = h.sync.connect("42").await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)), "{err:?}");
    assert_eq!(h.sync.reconnect_attempts(), 1);

    h.wait_for_state(ReadyState::Open).await;
    assert_eq!(h.connector.attempt_gaps_ms(), vec![2000]);
    assert_eq!(h.sync.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn read_error_is_treated_as_abnormal_closure() {
    let mut h = Harness::new();
    h.sync.connect("42").await.unwrap();
    let server = h.connector.server(0);

    server.send_read_error();
    h.connector.wait_for_attempts(2).await;

    assert_eq!(h.connector.attempt_gaps_ms(), vec![2000]);
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_codes_use_backoff() {
    let mut h = Harness::new();
    h.sync.connect("42").await.unwrap();

    h.connector.server(0).send_close(1011);
    h.connector.wait_for_attempts(2).await;

    assert_eq!(h.connector.attempt_gaps_ms(), vec![2000]);
    assert_eq!(h.refresher.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn exactly_one_reconnect_per_closure() {
    let mut h = Harness::new();
    h.sync.connect("42").await.unwrap();

    h.connector.server(0).drop_connection();
    h.connector.wait_for_attempts(2).await;
    tokio::time::sleep(Duration::from_secs(25)).await;

    assert_eq!(h.connector.attempts(), 2);
    assert!(h.sync.is_connected());
}

#[tokio::test(start_paused = true)]
async fn handshake_rejected_on_reconnect_logs_out() {
    let connector = MockConnector::scripted(vec![Outcome::Accept, Outcome::RejectAuth], Outcome::Accept);
    let mut h = Harness::with_connector(connector);
    let mut notices = h.sync.notices();
    h.sync.connect("42").await.unwrap();

    h.connector.server(0).drop_connection();

    assert_eq!(notices.recv().await.unwrap(), Notice::SessionExpired);
    assert_eq!(h.access_token(), None);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(h.sync.ready_state(), ReadyState::Closed);
}
