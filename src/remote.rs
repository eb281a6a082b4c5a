//! Orders backend client.
//!
//! `OrdersApi` is the raw request seam (HTTP in production, an in-memory
//! fake in tests). `RemoteClient` wraps it with the bounded timeout, shape
//! validation and the shared reachability indicator.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::normalize_api_url;
use crate::error::{SyncError, SyncResult};
use crate::model::OrderRecord;

// ---------------------------------------------------------------------------
// Reachability indicator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Unknown,
    Online,
    Offline,
    /// Backend answers but with malformed data; the cached view is shown.
    Degraded,
}

/// Last known backend outcome, shared by every component of one instance.
#[derive(Clone)]
pub struct Reachability {
    tx: Arc<watch::Sender<ServerStatus>>,
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new()
    }
}

impl Reachability {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServerStatus::Unknown);
        Self { tx: Arc::new(tx) }
    }

    pub fn status(&self) -> ServerStatus {
        *self.tx.borrow()
    }

    /// Optimistic writes try the backend unless it is known to be down.
    pub fn is_reachable(&self) -> bool {
        self.status() != ServerStatus::Offline
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.tx.subscribe()
    }

    pub fn set(&self, status: ServerStatus) {
        let previous = self.tx.send_replace(status);
        if previous != status {
            info!(from = ?previous, to = ?status, "backend reachability changed");
        }
    }
}

// ---------------------------------------------------------------------------
// Raw request seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OrdersApi: Send + Sync {
    async fn list(&self) -> SyncResult<Value>;
    async fn create(&self, record: &OrderRecord) -> SyncResult<Value>;
    async fn update(&self, id: &str, record: &OrderRecord) -> SyncResult<Value>;
    async fn delete(&self, id: &str) -> SyncResult<Value>;
    async fn health(&self) -> SyncResult<Value>;
}

/// `OrdersApi` over HTTP/JSON (`{api}/orders`, `{api}/health`).
pub struct HttpOrdersApi {
    base_url: String,
    client: Client,
    health_client: Client,
}

impl HttpOrdersApi {
    pub fn new(api_url: &str, request_timeout: Duration, health_timeout: Duration) -> SyncResult<Self> {
        let build = |timeout| {
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| SyncError::RemoteUnavailable(format!("Failed to create HTTP client: {e}")))
        };
        Ok(Self {
            base_url: normalize_api_url(api_url),
            client: build(request_timeout)?,
            health_client: build(health_timeout)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, id: &str) -> String {
        format!("{}/orders/{}", self.base_url, percent_encode(id))
    }

    async fn request(
        &self,
        client: &Client,
        method: Method,
        url: String,
        body: Option<&OrderRecord>,
    ) -> SyncResult<Value> {
        let mut req = client
            .request(method.clone(), &url)
            .header("Accept", "application/json");
        if let Some(record) = body {
            req = req.json(record);
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::RemoteUnavailable(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        debug!(
            %method,
            url = %url,
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "orders backend request"
        );

        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_failure(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| SyncError::Protocol(format!("Invalid JSON from orders backend: {e}")))
    }
}

#[async_trait]
impl OrdersApi for HttpOrdersApi {
    async fn list(&self) -> SyncResult<Value> {
        let url = format!("{}/orders", self.base_url);
        self.request(&self.client, Method::GET, url, None).await
    }

    async fn create(&self, record: &OrderRecord) -> SyncResult<Value> {
        let url = format!("{}/orders", self.base_url);
        self.request(&self.client, Method::POST, url, Some(record)).await
    }

    async fn update(&self, id: &str, record: &OrderRecord) -> SyncResult<Value> {
        let url = self.order_url(id);
        self.request(&self.client, Method::PUT, url, Some(record)).await
    }

    async fn delete(&self, id: &str) -> SyncResult<Value> {
        let url = self.order_url(id);
        self.request(&self.client, Method::DELETE, url, None).await
    }

    async fn health(&self) -> SyncResult<Value> {
        let url = format!("{}/health", self.base_url);
        self.request(&self.health_client, Method::GET, url, None).await
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach orders backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid orders backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// 4xx is a rejection, except throttling/timeouts which are worth retrying.
fn classify_failure(status: StatusCode, body_text: &str) -> SyncError {
    let code = status.as_u16();
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| {
            let trimmed = body_text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unexpected response")
                .to_string()
        });

    match code {
        408 | 429 => SyncError::RemoteUnavailable(format!("{message} (HTTP {code})")),
        400..=499 => SyncError::RemoteRejected {
            status: code,
            message,
        },
        _ => SyncError::RemoteUnavailable(format!("Orders backend server error (HTTP {code}): {message}")),
    }
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Remote client
// ---------------------------------------------------------------------------

pub struct RemoteClient {
    api: Arc<dyn OrdersApi>,
    status: Reachability,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(api: Arc<dyn OrdersApi>, status: Reachability, timeout: Duration) -> Self {
        Self {
            api,
            status,
            timeout,
        }
    }

    pub fn reachability(&self) -> &Reachability {
        &self.status
    }

    /// Run one round trip under the timeout and record its outcome.
    async fn call<F>(&self, op: &'static str, fut: F) -> SyncResult<Value>
    where
        F: Future<Output = SyncResult<Value>>,
    {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::RemoteUnavailable(format!(
                "{op} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };
        match &result {
            Ok(_) | Err(SyncError::RemoteRejected { .. }) => self.status.set(ServerStatus::Online),
            Err(SyncError::RemoteUnavailable(e)) => {
                warn!(op, error = %e, "orders backend unavailable");
                self.status.set(ServerStatus::Offline);
            }
            Err(SyncError::Protocol(_)) => self.status.set(ServerStatus::Degraded),
            Err(_) => {}
        }
        result
    }

    fn protocol_error(&self, message: String) -> SyncError {
        self.status.set(ServerStatus::Degraded);
        SyncError::Protocol(message)
    }

    /// Authoritative list, newest first. Anything but an array of objects is
    /// a `Protocol` error.
    pub async fn list(&self) -> SyncResult<Vec<OrderRecord>> {
        let value = self.call("list", self.api.list()).await?;
        if !value.is_array() {
            return Err(self.protocol_error(format!(
                "expected an array of orders, got {}",
                json_kind(&value)
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| self.protocol_error(format!("order list entry malformed: {e}")))
    }

    /// Create and return the stored record; it must carry a server identity.
    pub async fn create(&self, record: &OrderRecord) -> SyncResult<OrderRecord> {
        let value = self.call("create", self.api.create(record)).await?;
        let created: OrderRecord = serde_json::from_value(value)
            .map_err(|e| self.protocol_error(format!("created order malformed: {e}")))?;
        if created.server_id.is_none() {
            return Err(self.protocol_error("created order has no identity".into()));
        }
        Ok(created)
    }

    /// Update by server id. Backends that only acknowledge get the sent
    /// record back, stamped with the id.
    pub async fn update(&self, id: &str, record: &OrderRecord) -> SyncResult<OrderRecord> {
        let value = self.call("update", self.api.update(id, record)).await?;
        let echoed = serde_json::from_value::<OrderRecord>(value)
            .ok()
            .filter(|r| r.server_id.as_deref() == Some(id));
        Ok(echoed.unwrap_or_else(|| OrderRecord {
            server_id: Some(id.to_string()),
            temp_id: None,
            ..record.clone()
        }))
    }

    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        self.call("delete", self.api.delete(id)).await.map(|_| ())
    }

    pub async fn health(&self) -> SyncResult<Value> {
        self.call("health", self.api.health()).await
    }
}
