use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot::error::TryRecvError;

use grid_manager::api::JsonMap;
use grid_manager::bus::client::BusClient;
use grid_manager::bus::protocol::Channel;
use grid_manager::clock::ManualClock;
use grid_manager::correlator::RequestCorrelator;

const TTL: Duration = Duration::from_secs(300);

/// Correlator wired to an in-memory bus session. The peer half is returned
/// so the session stays open for the duration of the test.
fn setup() -> (RequestCorrelator, std::sync::Arc<ManualClock>, tokio::io::DuplexStream) {
    let (local, peer) = tokio::io::duplex(16384);
    let (client, _listener) = BusClient::from_stream(local);
    let clock = ManualClock::new(0);
    (RequestCorrelator::new(client, clock.clone(), TTL), clock, peer)
}

fn reply_body(request_id: impl serde::Serialize, status: &str) -> JsonMap {
    let mut body = JsonMap::new();
    body.insert("request_id".to_string(), json!(request_id));
    body.insert("status".to_string(), json!(status));
    body
}

#[tokio::test]
async fn test_foreign_reply_is_discarded_and_request_stays_pending() {
    let (correlator, _clock, _peer) = setup();

    let (request_id, mut reply_rx) = correlator.send_correlated(Channel::AuthLogin, JsonMap::new()).unwrap();

    // A reply correlating to some other sender's request.
    correlator.on_reply(reply_body(uuid::Uuid::new_v4(), "success"));

    assert!(correlator.is_pending(&request_id));
    assert!(matches!(reply_rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_matching_reply_fires_continuation_exactly_once() {
    let (correlator, _clock, _peer) = setup();

    let (request_id, reply_rx) = correlator.send_correlated(Channel::WorkflowSubmission, JsonMap::new()).unwrap();
    assert_eq!(correlator.pending_count(), 1);

    correlator.on_reply(reply_body(request_id, "success"));
    assert!(!correlator.is_pending(&request_id));

    let body = reply_rx.await.expect("continuation must fire");
    assert_eq!(body.get("status").and_then(|v| v.as_str()), Some("success"));

    // The duplicate is absorbed with a warning; nothing to deliver to.
    correlator.on_reply(reply_body(request_id, "success"));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_reply_without_request_id_is_dropped() {
    let (correlator, _clock, _peer) = setup();
    let (request_id, _reply_rx) = correlator.send_correlated(Channel::AuthRegister, JsonMap::new()).unwrap();

    let mut body = JsonMap::new();
    body.insert("status".to_string(), json!("success"));
    correlator.on_reply(body);

    assert!(correlator.is_pending(&request_id));
}

#[tokio::test]
async fn test_sweep_expires_only_old_requests() {
    let (correlator, clock, _peer) = setup();

    let (old_id, mut old_rx) = correlator.send_correlated(Channel::AuthLogin, JsonMap::new()).unwrap();
    clock.advance(TTL.as_millis() as i64 + 1_000);
    let (fresh_id, _fresh_rx) = correlator.send_correlated(Channel::AuthLogin, JsonMap::new()).unwrap();

    assert_eq!(correlator.sweep(), 1);
    assert!(!correlator.is_pending(&old_id));
    assert!(correlator.is_pending(&fresh_id));

    // The abandoned caller only sees its channel close; no reply, no retry.
    assert!(matches!(old_rx.try_recv(), Err(TryRecvError::Closed)));
}

#[tokio::test]
async fn test_sweep_keeps_everything_inside_ttl() {
    let (correlator, clock, _peer) = setup();
    for _ in 0..3 {
        correlator.send_correlated(Channel::AuthLogin, JsonMap::new()).unwrap();
    }
    clock.advance(1_000);
    assert_eq!(correlator.sweep(), 0);
    assert_eq!(correlator.pending_count(), 3);
}
