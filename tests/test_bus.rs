use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use grid_manager::api::JsonMap;
use grid_manager::bus::client::{BusClient, Dispatch};
use grid_manager::bus::codec::EnvelopeCodec;
use grid_manager::bus::protocol::{Channel, Envelope, Inbound};
use grid_manager::error::Result;

/// Dispatcher that records everything it is handed.
#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<Inbound>>,
}

impl Recorder {
    fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Inbound> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatch for Recorder {
    async fn dispatch(&self, message: Inbound) -> Result<()> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

fn task_event_body(workflow_id: Uuid, task_id: Uuid, volunteer_id: Uuid) -> JsonMap {
    let mut body = JsonMap::new();
    body.insert("workflow_id".to_string(), json!(workflow_id));
    body.insert("task_id".to_string(), json!(task_id));
    body.insert("volunteer_id".to_string(), json!(volunteer_id));
    body
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// The receive loop dispatches recognized messages, warns-and-skips unknown
/// channels and malformed bodies, and keeps running through all of it.
#[tokio::test]
async fn test_listener_dispatches_and_survives_garbage() {
    let (local, remote) = tokio::io::duplex(16384);
    let (_client, listener) = BusClient::from_stream(local);

    let recorder = Arc::new(Recorder::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher: Arc<dyn Dispatch> = recorder.clone();
    let listener_task = tokio::spawn(async move {
        listener.run(Channel::inbound(), dispatcher, shutdown_rx).await;
    });

    let (_read_half, write_half) = tokio::io::split(remote);
    let mut coordinator = FramedWrite::new(write_half, EnvelopeCodec::new());

    let (workflow_id, task_id, volunteer_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    // A valid accept event.
    coordinator
        .send(Envelope::new(Channel::TaskAccept, task_event_body(workflow_id, task_id, volunteer_id)))
        .await
        .unwrap();
    // A channel nobody registered.
    coordinator
        .send(Envelope { channel: "bogus/channel".to_string(), data: JsonMap::new() })
        .await
        .unwrap();
    // A recognized channel with a broken body (missing the key triple).
    coordinator.send(Envelope::new(Channel::TaskComplete, JsonMap::new())).await.unwrap();
    // The loop is still alive for a valid progress event.
    let mut progress = task_event_body(workflow_id, task_id, volunteer_id);
    progress.insert("progress".to_string(), json!(55.0));
    coordinator.send(Envelope::new(Channel::TaskProgress, progress)).await.unwrap();

    wait_until(|| recorder.len() >= 2).await;
    // Handlers run on independent tasks, so arrival order is not guaranteed.
    let messages = recorder.snapshot();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().any(|m| matches!(m, Inbound::TaskAccept(ev) if ev.task_id == task_id)));
    assert!(messages.iter().any(|m| matches!(m, Inbound::TaskProgress(ev) if ev.progress == Some(55.0))));

    shutdown_tx.send(true).unwrap();
    listener_task.await.unwrap();
}

/// publish() frames an envelope the peer can decode.
#[tokio::test]
async fn test_publish_reaches_the_peer() {
    let (local, remote) = tokio::io::duplex(16384);
    let (client, _listener) = BusClient::from_stream(local);

    let (read_half, _write_half) = tokio::io::split(remote);
    let mut coordinator = FramedRead::new(read_half, EnvelopeCodec::new());

    let mut body = JsonMap::new();
    body.insert("workflow_id".to_string(), json!(Uuid::new_v4()));
    body.insert("status".to_string(), json!("COMPLETED"));
    client.publish(Channel::WorkflowFinish, body).unwrap();

    let envelope = coordinator.next().await.unwrap().unwrap();
    assert_eq!(envelope.channel, "workflow/finish");
    assert_eq!(envelope.data.get("status").and_then(|v| v.as_str()), Some("COMPLETED"));
}

/// Correlated replies are routed as Reply regardless of which response
/// channel they ride on.
#[tokio::test]
async fn test_reply_channels_decode_to_reply() {
    let mut body = JsonMap::new();
    body.insert("request_id".to_string(), json!(Uuid::new_v4()));
    body.insert("status".to_string(), json!("success"));

    let decoded = Inbound::decode(Channel::WorkflowSubmissionResponse, body).unwrap();
    assert!(matches!(decoded, Some(Inbound::Reply { channel: Channel::WorkflowSubmissionResponse, .. })));
}

/// Outbound-only channels produce no inbound dispatch.
#[tokio::test]
async fn test_outbound_channels_are_not_dispatched() {
    assert!(Inbound::decode(Channel::WorkflowSubmission, JsonMap::new()).unwrap().is_none());
    assert!(Inbound::decode(Channel::WorkflowFinish, JsonMap::new()).unwrap().is_none());
}

/// Channel names round-trip through parse/as_str.
#[tokio::test]
async fn test_channel_names_round_trip() {
    for channel in [
        Channel::AuthRegister,
        Channel::AuthLogin,
        Channel::WorkflowSubmission,
        Channel::TaskAccept,
        Channel::TaskFinish,
        Channel::VolunteerAssignment,
        Channel::WorkflowFinish,
    ] {
        assert_eq!(Channel::parse(channel.as_str()), Some(channel));
    }
    assert_eq!(Channel::parse("definitely/not/a/channel"), None);
}
