//! In-memory orders backend for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::error::{SyncError, SyncResult};
use crate::model::OrderRecord;
use crate::remote::OrdersApi;

struct FakeState {
    records: Vec<OrderRecord>,
    next_id: u64,
    online: bool,
    latency: Option<Duration>,
    list_override: Option<Value>,
    reject_with: Option<(u16, String)>,
    bare_acks: bool,
    calls: Vec<String>,
}

/// Behaves like the real backend (newest first, `name`/`orderId` required,
/// 404 on unknown ids) and records every call as `"op"` or `"op:id"`.
pub struct FakeOrdersApi {
    state: Mutex<FakeState>,
    hold_creates: AtomicBool,
    pub create_started: Notify,
    create_release: Notify,
    hold_lists: AtomicBool,
    pub list_started: Notify,
    list_release: Notify,
}

impl FakeOrdersApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                records: Vec::new(),
                next_id: 1,
                online: true,
                latency: None,
                list_override: None,
                reject_with: None,
                bare_acks: false,
                calls: Vec::new(),
            }),
            hold_creates: AtomicBool::new(false),
            create_started: Notify::new(),
            create_release: Notify::new(),
            hold_lists: AtomicBool::new(false),
            list_started: Notify::new(),
            list_release: Notify::new(),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().unwrap().online = online;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    pub fn set_list_override(&self, value: Value) {
        self.state.lock().unwrap().list_override = Some(value);
    }

    /// Refuse every write with this HTTP status until cleared.
    pub fn set_reject(&self, reject: Option<(u16, &str)>) {
        self.state.lock().unwrap().reject_with = reject.map(|(s, m)| (s, m.to_string()));
    }

    /// Answer updates and deletes with a bare acknowledgement.
    pub fn set_bare_acks(&self, bare: bool) {
        self.state.lock().unwrap().bare_acks = bare;
    }

    /// Park every create after it is received until `release_create`.
    pub fn hold_creates(&self) {
        self.hold_creates.store(true, Ordering::SeqCst);
    }

    pub fn release_create(&self) {
        self.hold_creates.store(false, Ordering::SeqCst);
        self.create_release.notify_one();
    }

    /// Take the list as it is now, then park the response until `release_list`.
    pub fn hold_lists(&self) {
        self.hold_lists.store(true, Ordering::SeqCst);
    }

    pub fn release_list(&self) {
        self.hold_lists.store(false, Ordering::SeqCst);
        self.list_release.notify_one();
    }

    pub fn seed(&self, records: Vec<OrderRecord>) {
        let mut state = self.state.lock().unwrap();
        state.records = records;
    }

    pub fn records(&self) -> Vec<OrderRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(':').next() == Some(op))
            .count()
    }

    /// Record the call, apply latency, then fail if offline or rejecting.
    async fn enter(&self, call: String, is_write: bool) -> SyncResult<()> {
        let latency = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let state = self.state.lock().unwrap();
        if !state.online {
            return Err(SyncError::RemoteUnavailable("fake backend offline".into()));
        }
        if is_write {
            if let Some((status, message)) = &state.reject_with {
                return Err(SyncError::RemoteRejected {
                    status: *status,
                    message: message.clone(),
                });
            }
        }
        Ok(())
    }
}

fn not_found() -> SyncError {
    SyncError::RemoteRejected {
        status: 404,
        message: "Order not found".into(),
    }
}

#[async_trait]
impl OrdersApi for FakeOrdersApi {
    async fn list(&self) -> SyncResult<Value> {
        self.enter("list".into(), false).await?;
        let list = {
            let state = self.state.lock().unwrap();
            match &state.list_override {
                Some(value) => value.clone(),
                None => serde_json::to_value(&state.records)?,
            }
        };
        if self.hold_lists.load(Ordering::SeqCst) {
            self.list_started.notify_one();
            self.list_release.notified().await;
        }
        Ok(list)
    }

    async fn create(&self, record: &OrderRecord) -> SyncResult<Value> {
        self.enter(format!("create:{}", record.name), true).await?;
        if self.hold_creates.load(Ordering::SeqCst) {
            self.create_started.notify_one();
            self.create_release.notified().await;
        }

        if record.name.trim().is_empty() || record.order_id.trim().is_empty() {
            return Err(SyncError::RemoteRejected {
                status: 400,
                message: "name and orderId are required".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        let stored = OrderRecord {
            server_id: Some(format!("srv-{}", state.next_id)),
            temp_id: None,
            created_at: Some(record.created_at.unwrap_or_else(Utc::now)),
            updated_at: None,
            ..record.clone()
        };
        state.next_id += 1;
        state.records.insert(0, stored.clone());
        Ok(serde_json::to_value(stored)?)
    }

    async fn update(&self, id: &str, record: &OrderRecord) -> SyncResult<Value> {
        self.enter(format!("update:{id}"), true).await?;
        let mut state = self.state.lock().unwrap();
        let bare = state.bare_acks;
        let existing = state
            .records
            .iter_mut()
            .find(|r| r.server_id.as_deref() == Some(id))
            .ok_or_else(not_found)?;
        let previous = existing.updated_at;
        *existing = OrderRecord {
            server_id: existing.server_id.clone(),
            temp_id: None,
            created_at: existing.created_at,
            updated_at: Some(Utc::now()),
            ..record.clone()
        };
        if existing.updated_at == previous {
            existing.updated_at = previous.map(|t| t + chrono::Duration::milliseconds(1));
        }
        if bare {
            return Ok(json!({ "ok": true }));
        }
        Ok(serde_json::to_value(existing.clone())?)
    }

    async fn delete(&self, id: &str) -> SyncResult<Value> {
        self.enter(format!("delete:{id}"), true).await?;
        let mut state = self.state.lock().unwrap();
        let idx = state
            .records
            .iter()
            .position(|r| r.server_id.as_deref() == Some(id))
            .ok_or_else(not_found)?;
        state.records.remove(idx);
        if state.bare_acks {
            return Ok(Value::Null);
        }
        Ok(json!({ "message": "Order deleted" }))
    }

    async fn health(&self) -> SyncResult<Value> {
        self.enter("health".into(), false).await?;
        Ok(json!({ "status": "ok" }))
    }
}
