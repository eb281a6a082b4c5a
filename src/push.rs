//! Push channel between instances.
//!
//! Frames are `{event, payload}` JSON objects carried by any `PushTransport`.
//! Delivery is best effort: no ordering, no dedup, no acknowledgement.
//! Malformed frames are dropped on receipt.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SyncConfig;
use crate::model::{OrderRecord, Snapshot};

pub const EVENT_HELLO: &str = "orders:hello";
pub const EVENT_SYNC: &str = "orders:sync";
pub const EVENT_FULL: &str = "orders:full";
pub const EVENT_ORDER_CREATED: &str = "order:created";
pub const EVENT_ORDER_UPDATED: &str = "order:updated";
pub const EVENT_ORDER_DELETED: &str = "order:deleted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl RawFrame {
    pub fn new(event: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            payload,
        }
    }
}

/// A full list received from a peer (`orders:sync`) or the relay
/// (`orders:full`, which has no origin).
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingSnapshot {
    pub origin_client: Option<String>,
    pub list: Vec<OrderRecord>,
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Hello {
        origin_client: String,
        last_updated: i64,
    },
    Sync(IncomingSnapshot),
    Full(IncomingSnapshot),
    OrderCreated(OrderRecord),
    OrderUpdated(OrderRecord),
    OrderDeleted(String),
}

impl PushEvent {
    /// Decode a frame. `None` for unknown events and malformed payloads.
    pub fn parse(frame: &RawFrame) -> Option<Self> {
        let payload = &frame.payload;
        match frame.event.as_str() {
            EVENT_HELLO => Some(PushEvent::Hello {
                origin_client: non_empty_str(payload.get("clientId"))?,
                last_updated: payload.get("lastUpdated").and_then(as_millis).unwrap_or(0),
            }),
            EVENT_SYNC => parse_snapshot(payload, true).map(PushEvent::Sync),
            EVENT_FULL => parse_snapshot(payload, false).map(PushEvent::Full),
            EVENT_ORDER_CREATED => parse_record(payload).map(PushEvent::OrderCreated),
            EVENT_ORDER_UPDATED => parse_record(payload).map(PushEvent::OrderUpdated),
            EVENT_ORDER_DELETED => parse_deleted_id(payload).map(PushEvent::OrderDeleted),
            _ => None,
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn as_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_snapshot(payload: &Value, with_origin: bool) -> Option<IncomingSnapshot> {
    let last_updated = payload.get("lastUpdated").and_then(as_millis)?;
    let list = payload.get("list")?;
    if !list.is_array() {
        return None;
    }
    let list: Vec<OrderRecord> = serde_json::from_value(list.clone()).ok()?;
    Some(IncomingSnapshot {
        origin_client: if with_origin {
            non_empty_str(payload.get("clientId"))
        } else {
            None
        },
        list,
        last_updated,
    })
}

/// The record itself, or wrapped as `{record: ..}`. Must carry an identity.
fn parse_record(payload: &Value) -> Option<OrderRecord> {
    let body = match payload.get("record") {
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    };
    if !body.is_object() {
        return None;
    }
    let record: OrderRecord = serde_json::from_value(body.clone()).ok()?;
    record.identity().map(|_| record)
}

fn parse_deleted_id(payload: &Value) -> Option<String> {
    if payload.is_string() {
        return non_empty_str(Some(payload));
    }
    ["_id", "id", "deletedId"]
        .iter()
        .find_map(|key| non_empty_str(payload.get(*key)))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Carries frames between instances. `send` must never block.
pub trait PushTransport: Send + Sync {
    fn send(&self, frame: RawFrame);
    fn subscribe(&self) -> broadcast::Receiver<RawFrame>;
}

/// In-process bus. Every subscriber, the sender included, sees every frame.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<RawFrame>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// A bus sized by `push_buffer`, to be shared by every instance that
    /// should see each other.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.push_buffer)
    }
}

impl PushTransport for LocalBus {
    fn send(&self, frame: RawFrame) {
        // No subscribers is fine: nobody is listening yet.
        if self.tx.send(frame).is_err() {
            trace!("push frame dropped, no subscribers");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RawFrame> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Channel adapter
// ---------------------------------------------------------------------------

pub struct PushChannel {
    client_id: String,
    transport: Arc<dyn PushTransport>,
}

impl PushChannel {
    pub fn new(client_id: String, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            client_id,
            transport,
        }
    }

    /// Broadcast this instance's full snapshot as `orders:sync`.
    pub fn publish_snapshot(&self, snapshot: &Snapshot) {
        debug!(
            records = snapshot.list.len(),
            last_updated = snapshot.last_updated,
            "publishing snapshot"
        );
        self.transport.send(RawFrame::new(
            EVENT_SYNC,
            json!({
                "clientId": self.client_id,
                "lastUpdated": snapshot.last_updated,
                "list": snapshot.list,
            }),
        ));
    }

    /// Presence announcement; peers holding something newer answer with a sync.
    pub fn announce(&self, last_updated: i64) {
        self.transport.send(RawFrame::new(
            EVENT_HELLO,
            json!({ "clientId": self.client_id, "lastUpdated": last_updated }),
        ));
    }

    /// Feed every well-formed incoming event to `handler` until the returned
    /// subscription is cancelled or dropped. Must be called inside a runtime.
    pub fn on_receive<F>(&self, handler: F) -> Subscription
    where
        F: Fn(PushEvent) + Send + 'static,
    {
        let mut rx = self.transport.subscribe();
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    received = rx.recv() => received,
                };
                match frame {
                    Ok(frame) => match PushEvent::parse(&frame) {
                        Some(event) => handler(event),
                        None => debug!(event = %frame.event, "dropping malformed push frame"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push receiver lagged, frames skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("push receiver stopped");
        });

        Subscription {
            token,
            task: Some(task),
        }
    }
}

/// Handle for an `on_receive` registration. Dropping it unsubscribes.
pub struct Subscription {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the receiver task to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn frame(event: &str, payload: Value) -> RawFrame {
        RawFrame::new(event, payload)
    }

    #[test]
    fn test_parse_sync_and_full() {
        let sync = PushEvent::parse(&frame(
            EVENT_SYNC,
            json!({ "clientId": "c_a", "lastUpdated": 200, "list": [{ "_id": "s1", "name": "A" }] }),
        ));
        match sync {
            Some(PushEvent::Sync(snap)) => {
                assert_eq!(snap.origin_client.as_deref(), Some("c_a"));
                assert_eq!(snap.last_updated, 200);
                assert_eq!(snap.list[0].server_id.as_deref(), Some("s1"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let full = PushEvent::parse(&frame(
            EVENT_FULL,
            json!({ "clientId": "ignored", "lastUpdated": "300", "list": [] }),
        ));
        match full {
            Some(PushEvent::Full(snap)) => {
                assert!(snap.origin_client.is_none());
                assert_eq!(snap.last_updated, 300);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let cases = [
            frame(EVENT_SYNC, json!({ "clientId": "c", "list": [] })),
            frame(EVENT_SYNC, json!({ "lastUpdated": 1, "list": { "not": "array" } })),
            frame(EVENT_SYNC, json!({ "lastUpdated": 1, "list": [1, 2] })),
            frame(EVENT_SYNC, json!("garbage")),
            frame(EVENT_HELLO, json!({ "lastUpdated": 1 })),
            frame(EVENT_ORDER_CREATED, json!({ "name": "no identity" })),
            frame(EVENT_ORDER_DELETED, json!({})),
            frame("orders:unknown", json!({})),
        ];
        for case in cases {
            assert!(PushEvent::parse(&case).is_none(), "{case:?} should be dropped");
        }
    }

    #[test]
    fn test_parse_per_record_events() {
        let created = PushEvent::parse(&frame(
            EVENT_ORDER_CREATED,
            json!({ "record": { "_id": "s1", "name": "A", "orderId": "X1" } }),
        ));
        assert!(matches!(created, Some(PushEvent::OrderCreated(r)) if r.name == "A"));

        let updated = PushEvent::parse(&frame(EVENT_ORDER_UPDATED, json!({ "_id": "s1", "name": "B" })));
        assert!(matches!(updated, Some(PushEvent::OrderUpdated(r)) if r.name == "B"));

        for payload in [json!("s1"), json!({ "_id": "s1" }), json!({ "deletedId": "s1" })] {
            assert_eq!(
                PushEvent::parse(&frame(EVENT_ORDER_DELETED, payload)),
                Some(PushEvent::OrderDeleted("s1".into()))
            );
        }
    }

    #[tokio::test]
    async fn test_snapshot_reaches_peer() {
        let bus = Arc::new(LocalBus::new(16));
        let a = PushChannel::new("c_a".into(), bus.clone());
        let b = PushChannel::new("c_b".into(), bus.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.on_receive(move |event| {
            let _ = tx.send(event);
        });

        bus.send(frame(EVENT_SYNC, json!("malformed first")));
        a.publish_snapshot(&Snapshot {
            list: vec![OrderRecord {
                server_id: Some("s1".into()),
                name: "A".into(),
                ..Default::default()
            }],
            last_updated: 42,
        });

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            PushEvent::Sync(snap) => {
                assert_eq!(snap.origin_client.as_deref(), Some("c_a"));
                assert_eq!(snap.last_updated, 42);
                assert_eq!(snap.list.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_delivery() {
        let bus = Arc::new(LocalBus::new(16));
        let channel = PushChannel::new("c_a".into(), bus.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = channel.on_receive(move |event| {
            let _ = tx.send(event);
        });
        sub.cancel();
        assert!(sub.is_cancelled());
        sub.shutdown().await;

        channel.announce(7);
        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(received, Ok(None)), "sender dropped with the task, nothing delivered");
    }
}
