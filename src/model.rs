//! Order records and the snapshot shape shared by the store, the queue and
//! the push channel.
//!
//! Wire parsing is deliberately lenient: the backend, older clients and CSV
//! imports disagree on whether timestamps are epoch millis or ISO strings and
//! whether `amount` is a number, a numeric string or `""`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Wall-clock milliseconds, the unit of `lastUpdated`.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Client-side placeholder identity for a record the backend has not seen.
pub fn new_temp_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("temp-{}-{}", now_ms(), &suffix[..8])
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Active identity of a record. Serialized as `{"id": ..}` or `{"tempId": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordId {
    #[serde(rename = "id")]
    Server(String),
    #[serde(rename = "tempId")]
    Temp(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Server(id) => write!(f, "{id}"),
            RecordId::Temp(id) => write!(f, "{id} (unsynced)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    #[serde(
        rename = "_id",
        alias = "id",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_id"
    )]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_id")]
    pub temp_id: Option<String>,
    #[serde(default, deserialize_with = "de_text")]
    pub order_id: String,
    #[serde(default, deserialize_with = "de_text")]
    pub name: String,
    #[serde(default, deserialize_with = "de_text")]
    pub phone: String,
    #[serde(default, deserialize_with = "de_text")]
    pub school: String,
    #[serde(default, deserialize_with = "de_text")]
    pub order_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_amount")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_timestamp")]
    pub order_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    /// Build a fresh unsynced record from a validated draft.
    pub fn from_draft(draft: &OrderDraft, temp_id: String, now: DateTime<Utc>) -> Self {
        let mut record = OrderRecord {
            temp_id: Some(temp_id),
            order_date_time: Some(now),
            created_at: Some(now),
            ..Default::default()
        };
        record.copy_fields(draft);
        record
    }

    /// Server identity wins over the placeholder once both are known.
    pub fn identity(&self) -> Option<RecordId> {
        if let Some(id) = &self.server_id {
            return Some(RecordId::Server(id.clone()));
        }
        self.temp_id.clone().map(RecordId::Temp)
    }

    pub fn matches(&self, id: &RecordId) -> bool {
        match id {
            RecordId::Server(s) => self.server_id.as_deref() == Some(s.as_str()),
            RecordId::Temp(t) => self.temp_id.as_deref() == Some(t.as_str()),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.server_id.is_some()
    }

    /// Apply an edit. `orderDateTime` and `createdAt` are kept as they were.
    pub fn apply_draft(&mut self, draft: &OrderDraft, now: DateTime<Utc>) {
        self.copy_fields(draft);
        if self.order_date_time.is_none() {
            self.order_date_time = Some(now);
        }
        self.updated_at = Some(now);
    }

    /// Drop the placeholder once the server identity is present.
    pub fn into_confirmed(mut self) -> Self {
        if self.server_id.is_some() {
            self.temp_id = None;
        }
        self
    }

    fn copy_fields(&mut self, draft: &OrderDraft) {
        self.name = draft.name.trim().to_string();
        self.phone = draft.phone.trim().to_string();
        self.school = draft.school.trim().to_string();
        self.order_id = draft.order_id.trim().to_string();
        self.order_name = draft.order_name.trim().to_string();
        self.amount = draft.amount;
    }
}

/// User-entered fields of an order, as submitted from the form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub school: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_name: String,
    #[serde(default, deserialize_with = "de_amount")]
    pub amount: Option<f64>,
}

impl OrderDraft {
    /// The backend refuses creates without `name` or `orderId`.
    pub fn validate(&self) -> SyncResult<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Validation("name is required".into()));
        }
        if self.order_id.trim().is_empty() {
            return Err(SyncError::Validation("orderId is required".into()));
        }
        if let Some(amount) = self.amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err(SyncError::Validation(format!(
                    "amount must be a non-negative number, got {amount}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One instance's complete view: the list plus its last-write-wins clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub list: Vec<OrderRecord>,
    #[serde(default)]
    pub last_updated: i64,
}

/// Occurrences of each non-empty `orderId`. Duplicates are flagged, not refused.
pub fn order_id_counts(list: &[OrderRecord]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for record in list {
        let key = record.order_id.trim();
        if key.is_empty() {
            continue;
        }
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Most recent record carrying `order_id`, used for form auto-fill.
pub fn latest_by_order_id<'a>(list: &'a [OrderRecord], order_id: &str) -> Option<&'a OrderRecord> {
    let wanted = order_id.trim();
    if wanted.is_empty() {
        return None;
    }
    list.iter()
        .filter(|r| r.order_id.trim() == wanted)
        .max_by_key(|r| r.created_at.or(r.order_date_time))
}

// ---------------------------------------------------------------------------
// Lenient field parsing
// ---------------------------------------------------------------------------

/// Accepts RFC 3339 strings, epoch-millis numbers and numeric strings.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
                .or_else(|| s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis))
        }
        _ => None,
    }
}

/// Non-negative finite amounts only; anything else reads as empty.
pub fn parse_amount(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (n.is_finite() && n >= 0.0).then_some(n)
}

fn de_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_timestamp))
}

fn de_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_amount))
}

fn de_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    })
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
