use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::JsonMap;
use crate::bus::client::BusClient;
use crate::bus::protocol::Channel;
use crate::clock::Clock;
use crate::error::Result;

/// An outbound request still waiting for its correlated reply.
#[derive(Debug)]
struct PendingRequest {
    channel: Channel,
    payload: JsonMap,
    created_at_ms: i64,
    reply_tx: oneshot::Sender<JsonMap>,
}

/// Tracks outbound requests awaiting a correlated reply and matches replies
/// back by their opaque `request_id`. The map is the single source of truth:
/// at most one live entry per id, deleted on the matching reply or on TTL
/// expiry. Unmatched, duplicate or foreign replies are discarded with a
/// warning.
#[derive(Debug, Clone)]
pub struct RequestCorrelator {
    bus: BusClient,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    pending: Arc<Mutex<HashMap<Uuid, PendingRequest>>>,
}

impl RequestCorrelator {
    pub fn new(bus: BusClient, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { bus, clock, ttl, pending: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Mints a fresh request id, records the pending entry, publishes
    /// `{request_id, ...body}` and returns immediately.
    ///
    /// # Returns
    /// The request id plus the receiver the continuation fires on. If the
    /// entry expires before a reply arrives the sender is dropped and the
    /// receiver resolves to `RecvError`; the request itself is never retried.
    pub fn send_correlated(&self, channel: Channel, mut body: JsonMap) -> Result<(Uuid, oneshot::Receiver<JsonMap>)> {
        let request_id = Uuid::new_v4();
        body.insert("request_id".to_string(), serde_json::json!(request_id));

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("Mutex poisoned");
            pending.insert(request_id, PendingRequest { channel, payload: body.clone(), created_at_ms: self.clock.now_ms(), reply_tx });
        }

        if let Err(e) = self.bus.publish(channel, body) {
            // Never leave an entry behind for a request that was not sent.
            self.pending.lock().expect("Mutex poisoned").remove(&request_id);
            return Err(e);
        }

        log::debug!("Correlated request {} sent on '{}'", request_id, channel.as_str());
        Ok((request_id, reply_rx))
    }

    /// Routes a reply body back to its waiting request. Invokes the
    /// continuation exactly once; anything without a live matching entry is
    /// absorbed here.
    pub fn on_reply(&self, body: JsonMap) {
        let request_id = body.get("request_id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok());
        let Some(request_id) = request_id else {
            log::warn!("Discarding reply without a parseable request_id");
            return;
        };

        let entry = self.pending.lock().expect("Mutex poisoned").remove(&request_id);
        match entry {
            Some(request) => {
                log::info!("Reply matched pending request {} on '{}'", request_id, request.channel.as_str());
                // The receiver may already be gone; that is the caller's loss.
                let _ = request.reply_tx.send(body);
            }
            None => log::warn!("Discarding reply for unknown or already-answered request {}", request_id),
        }
    }

    /// Drops every pending entry older than the TTL. The original caller is
    /// not notified beyond its reply channel closing.
    ///
    /// # Returns
    /// The number of entries discarded.
    pub fn sweep(&self) -> usize {
        let cutoff_ms = self.clock.now_ms() - self.ttl.as_millis() as i64;
        let mut pending = self.pending.lock().expect("Mutex poisoned");
        let before = pending.len();
        pending.retain(|request_id, request| {
            let keep = request.created_at_ms > cutoff_ms;
            if !keep {
                log::warn!("Expiring pending request {} on '{}' after TTL", request_id, request.channel.as_str());
                log::debug!("Expired request payload: {:?}", request.payload);
            }
            keep
        });
        before - pending.len()
    }

    pub fn is_pending(&self, request_id: &Uuid) -> bool {
        self.pending.lock().expect("Mutex poisoned").contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("Mutex poisoned").len()
    }

    /// Periodic sweep loop, cancelable through the shutdown signal.
    pub fn spawn_sweeper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let expired = correlator.sweep();
                        if expired > 0 {
                            log::info!("Swept {} expired pending requests", expired);
                        }
                    }
                }
            }
        })
    }
}
