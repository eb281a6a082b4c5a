//! Local Store: the working order list plus its `lastUpdated` clock.
//!
//! Pure data holder. Every mutation persists the snapshot slot and notifies
//! `subscribe()` watchers; publishing to peers is the engine's job.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::db::{self, DbState, CATEGORY_STORE, KEY_SNAPSHOT};
use crate::error::{SyncError, SyncResult};
use crate::model::{self, now_ms, OrderRecord, RecordId, Snapshot};

pub struct LocalStore {
    db: Arc<DbState>,
    list: Vec<OrderRecord>,
    last_updated: i64,
    changed: watch::Sender<i64>,
}

impl LocalStore {
    /// Read the persisted snapshot. Absent or unreadable ⇒ empty at 0.
    pub fn load(db: Arc<DbState>) -> Self {
        let snapshot = read_snapshot(&db).unwrap_or_else(|e| {
            warn!(error = %e, "stored order snapshot unreadable, starting empty");
            Snapshot::default()
        });
        debug!(
            records = snapshot.list.len(),
            last_updated = snapshot.last_updated,
            "local store loaded"
        );
        let (changed, _) = watch::channel(snapshot.last_updated);
        Self {
            db,
            list: snapshot.list,
            last_updated: snapshot.last_updated,
            changed,
        }
    }

    /// Persist the current snapshot. In-memory state stays authoritative if
    /// this fails.
    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!(error = %e, "failed to persist order snapshot");
        }
    }

    fn try_save(&self) -> SyncResult<()> {
        let raw = serde_json::to_string(&SnapshotRef {
            list: &self.list,
            last_updated: self.last_updated,
        })?;
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        db::set_setting(&conn, CATEGORY_STORE, KEY_SNAPSHOT, &raw)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            list: self.list.clone(),
            last_updated: self.last_updated,
        }
    }

    pub fn list(&self) -> &[OrderRecord] {
        &self.list
    }

    pub fn last_updated(&self) -> i64 {
        self.last_updated
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, id: &RecordId) -> Option<&OrderRecord> {
        self.list.iter().find(|r| r.matches(id))
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some()
    }

    pub fn latest_by_order_id(&self, order_id: &str) -> Option<&OrderRecord> {
        model::latest_by_order_id(&self.list, order_id)
    }

    /// Watch `lastUpdated`; fires after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.changed.subscribe()
    }

    /// Insert at the front when `id` is `None`, otherwise replace the entry
    /// with that identity (inserting at the front if it is gone).
    pub fn upsert(&mut self, id: Option<&RecordId>, record: OrderRecord) -> i64 {
        match id.and_then(|id| self.position(id)) {
            Some(idx) => self.list[idx] = record,
            None => self.list.insert(0, record),
        }
        self.commit()
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<OrderRecord> {
        let idx = self.position(id)?;
        let removed = self.list.remove(idx);
        self.commit();
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.list.clear();
        self.commit();
    }

    /// Swap in a server-confirmed record, matching by server id first and
    /// then by the placeholder it replaces. Never duplicates.
    pub(crate) fn reconcile_confirmed(
        &mut self,
        temp_id: Option<&str>,
        confirmed: OrderRecord,
        insert_if_missing: bool,
    ) -> bool {
        let confirmed = confirmed.into_confirmed();
        let by_server = confirmed
            .server_id
            .clone()
            .and_then(|s| self.position(&RecordId::Server(s)));
        let by_temp = || temp_id.and_then(|t| self.position(&RecordId::Temp(t.to_string())));

        match by_server.or_else(by_temp) {
            Some(idx) => {
                if self.list[idx] == confirmed {
                    return false;
                }
                self.list[idx] = confirmed;
            }
            None if insert_if_missing => self.list.insert(0, confirmed),
            None => return false,
        }
        self.commit();
        true
    }

    /// Adopt a newer snapshot wholesale, including its clock.
    pub(crate) fn replace_snapshot(&mut self, snapshot: Snapshot) {
        self.list = snapshot.list;
        self.last_updated = snapshot.last_updated;
        self.save();
        self.changed.send_replace(self.last_updated);
    }

    /// Replace the list with the backend's view, stamping a fresh clock.
    pub(crate) fn replace_list(&mut self, list: Vec<OrderRecord>) -> i64 {
        self.list = list;
        self.commit()
    }

    fn position(&self, id: &RecordId) -> Option<usize> {
        self.list.iter().position(|r| r.matches(id))
    }

    fn commit(&mut self) -> i64 {
        self.last_updated = now_ms().max(self.last_updated + 1);
        self.save();
        self.changed.send_replace(self.last_updated);
        self.last_updated
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    list: &'a [OrderRecord],
    last_updated: i64,
}

fn read_snapshot(db: &DbState) -> SyncResult<Snapshot> {
    let raw = {
        let conn = db
            .conn
            .lock()
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        db::get_setting(&conn, CATEGORY_STORE, KEY_SNAPSHOT)
    };
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Snapshot::default()),
    }
}
