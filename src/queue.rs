//! Mutation Queue: ordered, persisted record of backend writes that have not
//! been confirmed yet.
//!
//! Entries move `Pending → InFlight → (removed | Pending again | Rejected)`.
//! Only the head is ever in flight, which is what keeps replay strictly FIFO.
//! The whole queue is rewritten to `sync_queue` after every change; the
//! in-memory copy stays authoritative when that write fails.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::error::{SyncError, SyncResult};
use crate::model::{OrderRecord, RecordId};

/// One backend write, tagged by operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mutation {
    Create {
        #[serde(rename = "tempId")]
        temp_id: String,
        item: OrderRecord,
    },
    Update {
        target: RecordId,
        item: OrderRecord,
    },
    Delete {
        target: RecordId,
    },
}

impl Mutation {
    pub fn operation(&self) -> &'static str {
        match self {
            Mutation::Create { .. } => "create",
            Mutation::Update { .. } => "update",
            Mutation::Delete { .. } => "delete",
        }
    }

    fn is_create_for(&self, temp: &str) -> bool {
        matches!(self, Mutation::Create { temp_id, .. } if temp_id == temp)
    }

    fn is_update_for(&self, id: &RecordId) -> bool {
        matches!(self, Mutation::Update { target, .. } if target == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    InFlight,
    /// Refused by the backend (4xx); kept for visibility, never replayed.
    Rejected,
}

impl EntryState {
    fn as_str(self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            // A crash mid-flight means the effect was never confirmed.
            EntryState::InFlight => "pending",
            EntryState::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub seq: i64,
    pub mutation: Mutation,
    pub state: EntryState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// What deleting an unsynced record did to its queued create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateCancel {
    /// The pending create (and any edits queued behind it) were dropped.
    Cancelled,
    /// The create is being replayed right now; it cannot be withdrawn.
    InFlight,
    NotQueued,
}

pub struct MutationQueue {
    db: Arc<DbState>,
    entries: VecDeque<QueueEntry>,
    rejected: Vec<QueueEntry>,
    next_seq: i64,
}

impl MutationQueue {
    /// Restore the queue persisted by a previous run. Unreadable rows are
    /// dropped with a warning.
    pub fn load(db: Arc<DbState>) -> Self {
        let rows = read_rows(&db).unwrap_or_else(|e| {
            warn!(error = %e, "failed to read persisted sync queue, starting empty");
            Vec::new()
        });

        let mut entries = VecDeque::new();
        let mut rejected = Vec::new();
        let mut next_seq = 1;
        for entry in rows {
            next_seq = next_seq.max(entry.seq + 1);
            match entry.state {
                EntryState::Rejected => rejected.push(entry),
                _ => entries.push_back(entry),
            }
        }
        if !entries.is_empty() {
            info!(pending = entries.len(), "restored pending sync queue");
        }

        Self {
            db,
            entries,
            rejected,
            next_seq,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn rejected(&self) -> &[QueueEntry] {
        &self.rejected
    }

    /// Append and persist. Returns the entry's sequence number.
    pub fn enqueue(&mut self, mutation: Mutation) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(seq, operation = mutation.operation(), "queued mutation");
        self.entries.push_back(QueueEntry {
            seq,
            mutation,
            state: EntryState::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        });
        self.persist();
        seq
    }

    /// Mark the head in flight and hand out a copy. `None` when the queue is
    /// empty or the head is already being replayed.
    pub fn begin_head(&mut self) -> Option<QueueEntry> {
        let head = self.entries.front_mut()?;
        if head.state != EntryState::Pending {
            return None;
        }
        head.state = EntryState::InFlight;
        head.attempts += 1;
        Some(head.clone())
    }

    /// Remove a confirmed (or moot) entry. `false` if it was already gone.
    pub fn complete(&mut self, seq: i64) -> bool {
        let Some(idx) = self.index_of(seq) else {
            return false;
        };
        self.entries.remove(idx);
        self.persist();
        true
    }

    /// Put an in-flight entry back to `Pending` after a transient failure.
    pub fn retry_later(&mut self, seq: i64, err: &SyncError) {
        if let Some(idx) = self.index_of(seq) {
            let entry = &mut self.entries[idx];
            entry.state = EntryState::Pending;
            entry.last_error = Some(err.to_string());
            self.persist();
        }
    }

    /// Return a head abandoned mid-flight (its drain was dropped) to `Pending`.
    pub fn release_in_flight(&mut self) -> bool {
        match self.entries.front_mut() {
            Some(head) if head.state == EntryState::InFlight => {
                head.state = EntryState::Pending;
                true
            }
            _ => false,
        }
    }

    /// Move an entry the backend refused out of the FIFO.
    pub fn reject(&mut self, seq: i64, err: &SyncError) {
        if let Some(idx) = self.index_of(seq) {
            if let Some(mut entry) = self.entries.remove(idx) {
                warn!(
                    seq,
                    operation = entry.mutation.operation(),
                    error = %err,
                    "backend rejected queued mutation"
                );
                entry.state = EntryState::Rejected;
                entry.last_error = Some(err.to_string());
                self.rejected.push(entry);
                self.persist();
            }
        }
    }

    pub fn clear_rejected(&mut self) {
        if !self.rejected.is_empty() {
            self.rejected.clear();
            self.persist();
        }
    }

    /// Withdraw the queued create for `temp` together with edits queued
    /// against the same placeholder.
    pub fn cancel_create(&mut self, temp: &str) -> CreateCancel {
        let Some(create) = self.entries.iter().find(|e| e.mutation.is_create_for(temp)) else {
            return CreateCancel::NotQueued;
        };
        if create.state == EntryState::InFlight {
            return CreateCancel::InFlight;
        }
        self.purge_creates(temp);
        CreateCancel::Cancelled
    }

    /// Drop pending creates and updates addressed to `temp`. In-flight
    /// entries are left alone. Returns how many entries were removed.
    pub fn purge_creates(&mut self, temp: &str) -> usize {
        let target = RecordId::Temp(temp.to_string());
        let before = self.entries.len();
        self.entries.retain(|e| {
            e.state == EntryState::InFlight
                || !(e.mutation.is_create_for(temp) || e.mutation.is_update_for(&target))
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(temp_id = temp, removed, "purged queued writes for unsynced record");
            self.persist();
        }
        removed
    }

    /// Drop every entry addressed to `temp`, whatever its state. Used when
    /// a queued create meets its own queued delete.
    pub fn discard_temp(&mut self, temp: &str) -> usize {
        let target = RecordId::Temp(temp.to_string());
        let before = self.entries.len();
        self.entries.retain(|e| match &e.mutation {
            Mutation::Create { temp_id, .. } => temp_id != temp,
            Mutation::Update { target: t, .. } | Mutation::Delete { target: t } => *t != target,
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist();
        }
        removed
    }

    /// Fold an edit into the still-pending create for `temp`. `false` when
    /// there is no pending create to rewrite.
    pub fn rewrite_pending_create(&mut self, temp: &str, item: &OrderRecord) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.state == EntryState::Pending && e.mutation.is_create_for(temp))
        else {
            return false;
        };
        if let Mutation::Create { item: queued, .. } = &mut entry.mutation {
            *queued = item.clone();
        }
        self.persist();
        true
    }

    /// Re-target writes queued against `temp` at the server identity it
    /// resolved to. Returns how many entries changed.
    pub fn resolve_temp(&mut self, temp: &str, server_id: &str) -> usize {
        let from = RecordId::Temp(temp.to_string());
        let mut changed = 0;
        for entry in self.entries.iter_mut() {
            match &mut entry.mutation {
                Mutation::Update { target, item } if *target == from => {
                    *target = RecordId::Server(server_id.to_string());
                    item.server_id = Some(server_id.to_string());
                    item.temp_id = None;
                    changed += 1;
                }
                Mutation::Delete { target } if *target == from => {
                    *target = RecordId::Server(server_id.to_string());
                    changed += 1;
                }
                _ => {}
            }
        }
        if changed > 0 {
            debug!(temp_id = temp, server_id, changed, "re-targeted queued writes");
            self.persist();
        }
        changed
    }

    pub fn has_pending_create(&self, temp: &str) -> bool {
        self.entries.iter().any(|e| e.mutation.is_create_for(temp))
    }

    pub fn has_pending_delete(&self, id: &RecordId) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(&e.mutation, Mutation::Delete { target } if target == id))
    }

    /// Latest queued payload for a confirmed record, if an update is waiting.
    pub fn pending_update_for(&self, server_id: &str) -> Option<&OrderRecord> {
        let target = RecordId::Server(server_id.to_string());
        self.entries.iter().rev().find_map(|e| match &e.mutation {
            Mutation::Update { target: t, item } if *t == target => Some(item),
            _ => None,
        })
    }

    /// Placeholders whose create has not been confirmed yet.
    pub fn pending_temp_ids(&self) -> HashSet<String> {
        self.entries
            .iter()
            .filter_map(|e| match &e.mutation {
                Mutation::Create { temp_id, .. } => Some(temp_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn index_of(&self, seq: i64) -> Option<usize> {
        self.entries.iter().position(|e| e.seq == seq)
    }

    /// Rewrite the persisted queue. Failures are logged, never propagated.
    pub fn persist(&self) {
        if let Err(e) = self.try_persist() {
            warn!(error = %e, "failed to persist sync queue");
        }
    }

    fn try_persist(&self) -> SyncResult<()> {
        let mut conn = self
            .db
            .conn
            .lock()
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sync_queue", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sync_queue (seq, operation, payload, status, attempts, last_error, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for entry in self.entries.iter().chain(self.rejected.iter()) {
                let payload = serde_json::to_string(&entry.mutation)?;
                stmt.execute(params![
                    entry.seq,
                    entry.mutation.operation(),
                    payload,
                    entry.state.as_str(),
                    entry.attempts,
                    entry.last_error,
                    entry.enqueued_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn read_rows(db: &DbState) -> SyncResult<Vec<QueueEntry>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::Persistence(e.to_string()))?;
    let mut stmt = conn.prepare(
        "SELECT seq, payload, status, attempts, last_error, enqueued_at
         FROM sync_queue ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, u32>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (seq, payload, status, attempts, last_error, enqueued_at) = row?;
        let mutation = match serde_json::from_str::<Mutation>(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(seq, error = %e, "dropping unreadable sync queue row");
                continue;
            }
        };
        entries.push(QueueEntry {
            seq,
            mutation,
            state: if status == "rejected" {
                EntryState::Rejected
            } else {
                EntryState::Pending
            },
            attempts,
            last_error,
            enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    fn test_queue() -> (Arc<DbState>, MutationQueue) {
        let db = Arc::new(db::open_in_memory().expect("open db"));
        let queue = MutationQueue::load(db.clone());
        (db, queue)
    }

    fn item(name: &str) -> OrderRecord {
        OrderRecord {
            name: name.into(),
            order_id: "X1".into(),
            ..Default::default()
        }
    }

    fn create(temp: &str) -> Mutation {
        Mutation::Create {
            temp_id: temp.into(),
            item: item("new"),
        }
    }

    #[test]
    fn test_mutation_wire_shape() {
        let value = serde_json::to_value(create("temp-1")).unwrap();
        assert_eq!(value["type"], "create");
        assert_eq!(value["tempId"], "temp-1");
        assert_eq!(value["item"]["name"], "new");

        let delete = serde_json::to_value(Mutation::Delete {
            target: RecordId::Server("s1".into()),
        })
        .unwrap();
        assert_eq!(delete, json!({ "type": "delete", "target": { "id": "s1" } }));
    }

    #[test]
    fn test_queue_survives_reload_in_order() {
        let (db, mut queue) = test_queue();
        queue.enqueue(create("t1"));
        queue.enqueue(Mutation::Delete {
            target: RecordId::Server("s1".into()),
        });
        queue.enqueue(create("t2"));

        let reloaded = MutationQueue::load(db);
        let ops: Vec<&str> = reloaded.entries().map(|e| e.mutation.operation()).collect();
        assert_eq!(ops, vec!["create", "delete", "create"]);
        let mut fresh = reloaded;
        assert_eq!(fresh.enqueue(create("t3")), 4);
    }

    #[test]
    fn test_only_one_head_in_flight() {
        let (_db, mut queue) = test_queue();
        let seq = queue.enqueue(create("t1"));
        queue.enqueue(create("t2"));

        let head = queue.begin_head().expect("head");
        assert_eq!(head.seq, seq);
        assert_eq!(head.state, EntryState::InFlight);
        assert!(queue.begin_head().is_none());

        queue.retry_later(seq, &SyncError::RemoteUnavailable("offline".into()));
        let again = queue.begin_head().expect("head after retry");
        assert_eq!(again.seq, seq);
        assert_eq!(again.attempts, 2);
        assert!(again.last_error.is_some());
    }

    #[test]
    fn test_release_abandoned_head() {
        let (_db, mut queue) = test_queue();
        queue.enqueue(create("t1"));
        assert!(!queue.release_in_flight());
        queue.begin_head().unwrap();
        assert!(queue.release_in_flight());
        assert!(queue.begin_head().is_some());
    }

    #[test]
    fn test_in_flight_entry_reloads_as_pending() {
        let (db, mut queue) = test_queue();
        queue.enqueue(create("t1"));
        queue.begin_head().unwrap();
        queue.persist();

        let mut reloaded = MutationQueue::load(db);
        assert_eq!(reloaded.entries().next().unwrap().state, EntryState::Pending);
        assert!(reloaded.begin_head().is_some());
    }

    #[test]
    fn test_complete_and_reject() {
        let (db, mut queue) = test_queue();
        let first = queue.enqueue(create("t1"));
        let second = queue.enqueue(create("t2"));

        queue.begin_head().unwrap();
        assert!(queue.complete(first));
        assert!(!queue.complete(first));

        queue.begin_head().unwrap();
        queue.reject(
            second,
            &SyncError::RemoteRejected {
                status: 400,
                message: "name required".into(),
            },
        );
        assert!(queue.is_empty());
        assert_eq!(queue.rejected().len(), 1);

        let reloaded = MutationQueue::load(db);
        assert!(reloaded.is_empty());
        assert_eq!(reloaded.rejected().len(), 1);
        assert_eq!(reloaded.rejected()[0].state, EntryState::Rejected);
    }

    #[test]
    fn test_cancel_pending_create_drops_its_edits() {
        let (_db, mut queue) = test_queue();
        queue.enqueue(create("t1"));
        queue.enqueue(Mutation::Update {
            target: RecordId::Temp("t1".into()),
            item: item("edited"),
        });
        queue.enqueue(create("t2"));

        assert_eq!(queue.cancel_create("t1"), CreateCancel::Cancelled);
        assert_eq!(queue.len(), 1);
        assert!(queue.has_pending_create("t2"));
        assert_eq!(queue.cancel_create("t1"), CreateCancel::NotQueued);
    }

    #[test]
    fn test_cannot_cancel_in_flight_create() {
        let (_db, mut queue) = test_queue();
        queue.enqueue(create("t1"));
        queue.begin_head().unwrap();
        assert_eq!(queue.cancel_create("t1"), CreateCancel::InFlight);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_rewrite_pending_create() {
        let (_db, mut queue) = test_queue();
        queue.enqueue(create("t1"));
        assert!(queue.rewrite_pending_create("t1", &item("edited")));
        match &queue.entries().next().unwrap().mutation {
            Mutation::Create { item, .. } => assert_eq!(item.name, "edited"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!queue.rewrite_pending_create("missing", &item("x")));

        queue.begin_head().unwrap();
        assert!(!queue.rewrite_pending_create("t1", &item("too late")));
    }

    #[test]
    fn test_resolve_temp_retargets_updates_and_deletes() {
        let (_db, mut queue) = test_queue();
        queue.enqueue(Mutation::Update {
            target: RecordId::Temp("t1".into()),
            item: OrderRecord {
                temp_id: Some("t1".into()),
                ..item("edited")
            },
        });
        queue.enqueue(Mutation::Delete {
            target: RecordId::Temp("t1".into()),
        });
        queue.enqueue(Mutation::Delete {
            target: RecordId::Temp("other".into()),
        });

        assert_eq!(queue.resolve_temp("t1", "s1"), 2);
        let server = RecordId::Server("s1".into());
        assert!(queue.has_pending_delete(&server));
        let pending = queue.pending_update_for("s1").expect("update re-targeted");
        assert_eq!(pending.server_id.as_deref(), Some("s1"));
        assert!(pending.temp_id.is_none());
        assert!(queue.has_pending_delete(&RecordId::Temp("other".into())));
    }

    #[test]
    fn test_unreadable_rows_are_skipped() {
        let (db, mut queue) = test_queue();
        queue.enqueue(create("t1"));
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO sync_queue (seq, operation, payload, status, attempts, enqueued_at)
                 VALUES (99, 'create', '{broken', 'pending', 0, '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }
        let reloaded = MutationQueue::load(db);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.pending_temp_ids().len(), 1);
    }
}
