//! Sync Reconciler.
//!
//! Applies every user mutation to the Local Store first, then either sends it
//! to the backend immediately or queues it. Also merges peer snapshots, keeps
//! the store aligned with the backend list and runs the background loop.
//!
//! Lock order is always queue, then in-flight creates, then store. No lock is
//! held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::model::{self, new_temp_id, OrderDraft, OrderRecord, RecordId, Snapshot};
use crate::push::{IncomingSnapshot, PushChannel, PushEvent, Subscription};
use crate::queue::{CreateCancel, Mutation, MutationQueue, QueueEntry};
use crate::remote::{RemoteClient, ServerStatus};
use crate::store::LocalStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Snapshot merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Our own broadcast came back.
    IgnoreOwn,
    Adopt,
    /// Local copy is newer; send it so the stale sender converges.
    Republish,
    /// Same clock, nothing to do.
    Keep,
}

/// Whole-list last-write-wins on `lastUpdated`.
pub fn merge_snapshot(local_last_updated: i64, incoming: &IncomingSnapshot, self_id: &str) -> MergeDecision {
    if incoming.origin_client.as_deref() == Some(self_id) {
        return MergeDecision::IgnoreOwn;
    }
    match incoming.last_updated.cmp(&local_last_updated) {
        std::cmp::Ordering::Greater => MergeDecision::Adopt,
        std::cmp::Ordering::Less => MergeDecision::Republish,
        std::cmp::Ordering::Equal => MergeDecision::Keep,
    }
}

// ---------------------------------------------------------------------------
// Drift detection
// ---------------------------------------------------------------------------

/// The backend list with local knowledge the backend cannot have yet laid
/// over it: unsynced records stay at the front, records with a queued delete
/// stay gone and records with a queued edit keep the local version.
pub fn overlay_backend_list(
    backend: Vec<OrderRecord>,
    local: &[OrderRecord],
    queue: &MutationQueue,
    creates_in_flight: &HashSet<String>,
) -> Vec<OrderRecord> {
    let pending_temps = queue.pending_temp_ids();
    let mut merged: Vec<OrderRecord> = local
        .iter()
        .filter(|r| !r.is_confirmed())
        .filter(|r| {
            r.temp_id
                .as_ref()
                .is_some_and(|t| pending_temps.contains(t) || creates_in_flight.contains(t))
        })
        .cloned()
        .collect();

    for record in backend {
        let Some(server_id) = record.server_id.clone() else {
            continue;
        };
        let id = RecordId::Server(server_id.clone());
        if queue.has_pending_delete(&id) {
            continue;
        }
        let edited = queue.pending_update_for(&server_id).map(|pending| {
            local
                .iter()
                .find(|r| r.matches(&id))
                .cloned()
                .unwrap_or_else(|| pending.clone())
        });
        merged.push(edited.unwrap_or(record));
    }
    merged
}

/// Count or per-record `updatedAt`/`createdAt` differ.
pub fn has_drifted(local: &[OrderRecord], target: &[OrderRecord]) -> bool {
    if local.len() != target.len() {
        return true;
    }
    let by_id: HashMap<RecordId, &OrderRecord> = local
        .iter()
        .filter_map(|r| r.identity().map(|id| (id, r)))
        .collect();
    target.iter().any(|r| {
        match r.identity().and_then(|id| by_id.get(&id)) {
            Some(l) => l.updated_at != r.updated_at || l.created_at != r.created_at,
            None => true,
        }
    })
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub confirmed: usize,
    pub rejected: usize,
    /// Entries dropped without a backend call (unresolvable or cancelled).
    pub discarded: usize,
    pub remaining: usize,
    /// Stopped at a head the backend could not be reached for.
    pub halted: bool,
    /// Another drain or immediate write held the queue.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Replaced { records: usize },
    /// Writes were in flight; checked again on the next tick.
    Deferred,
}

enum Replayed {
    Confirmed { changed: bool },
    Discarded { changed: bool },
}

#[derive(Default)]
struct CreatesInFlight {
    active: HashSet<String>,
    /// Deleted locally while their immediate create was on the wire.
    cancelled: HashSet<String>,
}

impl CreatesInFlight {
    /// Stop tracking `temp`. Returns whether it was deleted meanwhile.
    fn finish(&mut self, temp: &str) -> bool {
        self.active.remove(temp);
        self.cancelled.remove(temp)
    }
}

/// Holds the single "sending" slot. Dropping it, even mid-request, leaves
/// the queue replayable.
struct SenderGuard<'a> {
    engine: &'a SyncEngine,
    create: Option<String>,
}

impl Drop for SenderGuard<'_> {
    fn drop(&mut self) {
        let mut queue = lock(&self.engine.queue);
        if queue.release_in_flight() {
            debug!("returned abandoned in-flight entry to pending");
        }
        if let Some(temp) = self.create.take() {
            let mut inflight = lock(&self.engine.inflight);
            if inflight.active.contains(&temp) {
                let cancelled = inflight.finish(&temp);
                drop(inflight);
                let current = lock(&self.engine.store)
                    .get(&RecordId::Temp(temp.clone()))
                    .cloned();
                if let (false, Some(item)) = (cancelled, current) {
                    debug!(temp_id = %temp, "create abandoned mid-flight, queueing it");
                    queue.enqueue(Mutation::Create { temp_id: temp, item });
                }
            }
        }
        self.engine.busy.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    client_id: String,
    store: Mutex<LocalStore>,
    queue: Mutex<MutationQueue>,
    inflight: Mutex<CreatesInFlight>,
    remote: RemoteClient,
    push: PushChannel,
    /// Set while a drain or an immediate write is talking to the backend.
    busy: AtomicBool,
    /// Bumped whenever the backend acknowledges a write.
    writes: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        client_id: String,
        store: LocalStore,
        queue: MutationQueue,
        remote: RemoteClient,
        push: PushChannel,
    ) -> Self {
        Self {
            client_id,
            store: Mutex::new(store),
            queue: Mutex::new(queue),
            inflight: Mutex::new(CreatesInFlight::default()),
            remote,
            push,
            busy: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // -- reads --------------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        lock(&self.store).snapshot()
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        lock(&self.store).list().to_vec()
    }

    pub fn get(&self, id: &RecordId) -> Option<OrderRecord> {
        lock(&self.store).get(id).cloned()
    }

    pub fn latest_by_order_id(&self, order_id: &str) -> Option<OrderRecord> {
        lock(&self.store).latest_by_order_id(order_id).cloned()
    }

    pub fn order_id_counts(&self) -> HashMap<String, usize> {
        model::order_id_counts(lock(&self.store).list())
    }

    pub fn pending_mutations(&self) -> Vec<QueueEntry> {
        lock(&self.queue).entries().cloned().collect()
    }

    pub fn rejected_mutations(&self) -> Vec<QueueEntry> {
        lock(&self.queue).rejected().to_vec()
    }

    pub fn clear_rejected(&self) {
        lock(&self.queue).clear_rejected();
    }

    pub fn status(&self) -> ServerStatus {
        self.remote.reachability().status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServerStatus> {
        self.remote.reachability().subscribe()
    }

    /// Fires with the new `lastUpdated` after every store change.
    pub fn subscribe_changes(&self) -> watch::Receiver<i64> {
        lock(&self.store).subscribe()
    }

    // -- user mutations -----------------------------------------------------

    pub async fn create_order(&self, draft: OrderDraft) -> SyncResult<OrderRecord> {
        draft.validate()?;
        let temp_id = new_temp_id();
        let record = OrderRecord::from_draft(&draft, temp_id.clone(), Utc::now());

        let sender = {
            let mut queue = lock(&self.queue);
            lock(&self.store).upsert(None, record.clone());
            let sender = self.claim_immediate(&queue, Some(&temp_id));
            match &sender {
                Some(_) => {
                    lock(&self.inflight).active.insert(temp_id.clone());
                }
                None => {
                    queue.enqueue(Mutation::Create {
                        temp_id: temp_id.clone(),
                        item: record.clone(),
                    });
                }
            }
            sender
        };
        self.publish_local();
        info!(temp_id = %temp_id, order_id = %record.order_id, "order created locally");

        let Some(sender) = sender else {
            self.drain_if_reachable().await;
            return Ok(record);
        };

        let result = self.remote.create(&record).await;
        let outcome = match result {
            Ok(confirmed) => Ok(self.settle_create(&temp_id, confirmed, None).unwrap_or(record)),
            Err(e) => self.create_failed(&temp_id, record, e),
        };
        drop(sender);
        self.drain_if_reachable().await;
        outcome
    }

    pub async fn update_order(&self, id: &RecordId, draft: OrderDraft) -> SyncResult<OrderRecord> {
        draft.validate()?;

        let (previous, updated, sender) = {
            let mut queue = lock(&self.queue);
            let mut store = lock(&self.store);
            let previous = store
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::Validation(format!("no order with id {id}")))?;
            let mut record = previous.clone();
            record.apply_draft(&draft, Utc::now());
            store.upsert(Some(id), record.clone());
            drop(store);

            let sender = match record.identity() {
                Some(RecordId::Server(server_id)) => {
                    let sender = self.claim_immediate(&queue, None);
                    if sender.is_none() {
                        queue.enqueue(Mutation::Update {
                            target: RecordId::Server(server_id),
                            item: record.clone(),
                        });
                    }
                    sender
                }
                Some(RecordId::Temp(temp)) => {
                    self.queue_temp_edit(&mut queue, temp, &record);
                    None
                }
                None => None,
            };
            (previous, record, sender)
        };
        self.publish_local();

        let (Some(sender), Some(server_id)) = (sender, updated.server_id.clone()) else {
            self.drain_if_reachable().await;
            return Ok(updated);
        };

        let outcome = match self.remote.update(&server_id, &updated).await {
            Ok(confirmed) => {
                let target = RecordId::Server(server_id.clone());
                let changed = {
                    let queue = lock(&self.queue);
                    self.record_write();
                    let mut store = lock(&self.store);
                    // Skip if edited again or deleted while this was on the wire.
                    store.get(&target) == Some(&updated)
                        && !queue.has_pending_delete(&target)
                        && store.reconcile_confirmed(None, confirmed.clone(), false)
                };
                if changed {
                    self.publish_local();
                }
                Ok(confirmed)
            }
            Err(e) if e.is_retryable() => {
                let target = RecordId::Server(server_id);
                let mut queue = lock(&self.queue);
                let current = lock(&self.store).get(&target).cloned();
                if let Some(item) = current {
                    warn!(order = %target, error = %e, "backend unreachable, update queued");
                    queue.enqueue(Mutation::Update { target, item });
                }
                Ok(updated)
            }
            Err(e) => {
                if matches!(e, SyncError::RemoteRejected { .. }) && !e.is_not_found() {
                    self.restore_edit(&server_id, &updated, previous, &e);
                }
                Err(e)
            }
        };
        drop(sender);
        self.drain_if_reachable().await;
        outcome
    }

    pub async fn delete_order(&self, id: &RecordId) -> SyncResult<()> {
        let (removed, sender) = {
            let mut queue = lock(&self.queue);
            let Some(removed) = lock(&self.store).remove(id) else {
                debug!(order = %id, "delete for unknown order ignored");
                return Ok(());
            };
            let sender = match id {
                RecordId::Temp(temp) => {
                    match queue.cancel_create(temp) {
                        CreateCancel::Cancelled => {
                            info!(temp_id = %temp, "unsynced order deleted before reaching the backend");
                        }
                        CreateCancel::InFlight => {
                            queue.enqueue(Mutation::Delete { target: id.clone() });
                        }
                        CreateCancel::NotQueued => {
                            let mut inflight = lock(&self.inflight);
                            if inflight.active.contains(temp) {
                                inflight.cancelled.insert(temp.clone());
                            }
                        }
                    }
                    None
                }
                RecordId::Server(server_id) => {
                    let sender = self.claim_immediate(&queue, None);
                    if sender.is_none() {
                        queue.enqueue(Mutation::Delete { target: id.clone() });
                    }
                    sender.map(|s| (s, server_id.clone()))
                }
            };
            (removed, sender)
        };
        self.publish_local();

        let Some((sender, server_id)) = sender else {
            self.drain_if_reachable().await;
            return Ok(());
        };

        let outcome = match self.remote.delete(&server_id).await {
            Ok(()) => {
                self.record_write();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(server_id = %server_id, "order already gone on the backend");
                self.record_write();
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(server_id = %server_id, error = %e, "backend unreachable, delete queued");
                lock(&self.queue).enqueue(Mutation::Delete {
                    target: RecordId::Server(server_id),
                });
                Ok(())
            }
            Err(e) => {
                if matches!(e, SyncError::RemoteRejected { .. }) {
                    self.restore_deleted(removed, &e);
                }
                Err(e)
            }
        };
        drop(sender);
        self.drain_if_reachable().await;
        outcome
    }

    /// Insert every valid draft as a new unsynced order and queue its create.
    /// Returns how many were imported.
    pub async fn import_orders(&self, drafts: Vec<OrderDraft>) -> usize {
        let mut imported = 0;
        {
            let mut queue = lock(&self.queue);
            let mut store = lock(&self.store);
            let now = Utc::now();
            for draft in drafts {
                if let Err(e) = draft.validate() {
                    debug!(error = %e, "skipping invalid imported order");
                    continue;
                }
                let temp_id = new_temp_id();
                let record = OrderRecord::from_draft(&draft, temp_id.clone(), now);
                store.upsert(None, record.clone());
                queue.enqueue(Mutation::Create {
                    temp_id,
                    item: record,
                });
                imported += 1;
            }
        }
        if imported > 0 {
            info!(imported, "orders imported");
            self.publish_local();
            self.drain_if_reachable().await;
        }
        imported
    }

    /// Reset the local view. Nothing is deleted on the backend.
    pub fn clear_all(&self) {
        lock(&self.store).clear();
        info!("local order list cleared");
        self.publish_local();
    }

    // -- queue replay -------------------------------------------------------

    /// Replay queued mutations head first until the queue is empty or the
    /// backend is unreachable.
    pub async fn drain_queue(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut changed = false;
        let mut first = true;

        loop {
            let Some(sender) = self.try_claim(None) else {
                report.skipped = first;
                break;
            };
            first = false;
            changed |= self.drain_claimed(&mut report).await;
            drop(sender);

            // Something may have been queued while the slot was held.
            if report.halted || lock(&self.queue).is_empty() {
                break;
            }
        }

        report.remaining = lock(&self.queue).len();
        if changed {
            self.publish_local();
        }
        if report.confirmed + report.rejected + report.discarded > 0 || report.halted {
            info!(
                confirmed = report.confirmed,
                rejected = report.rejected,
                discarded = report.discarded,
                remaining = report.remaining,
                halted = report.halted,
                "sync queue drained"
            );
        }
        report
    }

    async fn drain_claimed(&self, report: &mut DrainReport) -> bool {
        let mut changed = false;
        loop {
            let Some(entry) = lock(&self.queue).begin_head() else {
                break;
            };
            debug!(
                seq = entry.seq,
                operation = entry.mutation.operation(),
                attempt = entry.attempts,
                "replaying queued mutation"
            );
            match self.replay(&entry).await {
                Ok(Replayed::Confirmed { changed: c }) => {
                    report.confirmed += 1;
                    changed |= c;
                }
                Ok(Replayed::Discarded { changed: c }) => {
                    report.discarded += 1;
                    changed |= c;
                }
                Err(e) if e.is_retryable() => {
                    let mut queue = lock(&self.queue);
                    queue.retry_later(entry.seq, &e);
                    info!(pending = queue.len(), error = %e, "Backend unreachable; keeping queue pending");
                    report.halted = true;
                    break;
                }
                Err(e) => {
                    let mut queue = lock(&self.queue);
                    queue.reject(entry.seq, &e);
                    if let Mutation::Create { temp_id, .. } = &entry.mutation {
                        queue.purge_creates(temp_id);
                    }
                    report.rejected += 1;
                }
            }
        }
        changed
    }

    async fn replay(&self, entry: &QueueEntry) -> SyncResult<Replayed> {
        match &entry.mutation {
            Mutation::Create { temp_id, item } => {
                let target = RecordId::Temp(temp_id.clone());
                {
                    let mut queue = lock(&self.queue);
                    if queue.has_pending_delete(&target) {
                        queue.discard_temp(temp_id);
                        let changed = lock(&self.store).remove(&target).is_some();
                        debug!(temp_id = %temp_id, "queued create cancelled by a later delete");
                        return Ok(Replayed::Discarded { changed });
                    }
                }
                let confirmed = self.remote.create(item).await?;
                let changed = self.settle_create(temp_id, confirmed, Some(entry.seq)).is_some();
                Ok(Replayed::Confirmed { changed })
            }
            Mutation::Update {
                target: RecordId::Temp(temp),
                ..
            } => {
                debug!(temp_id = %temp, "dropping update for an order the backend never stored");
                lock(&self.queue).complete(entry.seq);
                Ok(Replayed::Discarded { changed: false })
            }
            Mutation::Update {
                target: RecordId::Server(server_id),
                item,
            } => {
                let confirmed = self.remote.update(server_id, item).await?;
                let target = RecordId::Server(server_id.clone());
                let mut queue = lock(&self.queue);
                queue.complete(entry.seq);
                self.record_write();
                let superseded =
                    queue.has_pending_delete(&target) || queue.pending_update_for(server_id).is_some();
                let changed = !superseded && lock(&self.store).reconcile_confirmed(None, confirmed, false);
                Ok(Replayed::Confirmed { changed })
            }
            Mutation::Delete {
                target: target @ RecordId::Temp(temp),
            } => {
                let mut queue = lock(&self.queue);
                queue.purge_creates(temp);
                queue.complete(entry.seq);
                let changed = lock(&self.store).remove(target).is_some();
                Ok(Replayed::Discarded { changed })
            }
            Mutation::Delete {
                target: target @ RecordId::Server(server_id),
            } => {
                match self.remote.delete(server_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(server_id = %server_id, "order already gone on the backend");
                    }
                    Err(e) => return Err(e),
                }
                let mut queue = lock(&self.queue);
                queue.complete(entry.seq);
                self.record_write();
                let changed = lock(&self.store).remove(target).is_some();
                Ok(Replayed::Confirmed { changed })
            }
        }
    }

    /// Apply a confirmed create. Returns the record now in the store, or
    /// `None` when the order was deleted while the create was on the wire.
    fn settle_create(&self, temp_id: &str, confirmed: OrderRecord, seq: Option<i64>) -> Option<OrderRecord> {
        let server_id = confirmed.server_id.clone()?;
        let server = RecordId::Server(server_id.clone());

        let settled = {
            let mut queue = lock(&self.queue);
            self.record_write();
            if let Some(seq) = seq {
                queue.complete(seq);
            }
            let cancelled = lock(&self.inflight).finish(temp_id);
            queue.resolve_temp(temp_id, &server_id);

            if cancelled {
                info!(temp_id, server_id = %server_id, "order deleted while being created, queueing delete");
                queue.enqueue(Mutation::Delete { target: server });
                return None;
            }
            if queue.has_pending_delete(&server) {
                return None;
            }
            // Edits made in the meantime are queued; keep showing them.
            let settled = queue
                .pending_update_for(&server_id)
                .cloned()
                .unwrap_or(confirmed)
                .into_confirmed();
            lock(&self.store).reconcile_confirmed(Some(temp_id), settled.clone(), true);
            settled
        };
        debug!(temp_id, server_id = %server_id, "order confirmed by backend");
        self.publish_local();
        Some(settled)
    }

    fn create_failed(&self, temp_id: &str, record: OrderRecord, err: SyncError) -> SyncResult<OrderRecord> {
        let target = RecordId::Temp(temp_id.to_string());
        let rolled_back = {
            let mut queue = lock(&self.queue);
            let cancelled = lock(&self.inflight).finish(temp_id);
            queue.purge_creates(temp_id);

            if err.is_retryable() {
                let current = lock(&self.store).get(&target).cloned();
                return match (cancelled, current) {
                    (false, Some(item)) => {
                        warn!(temp_id, error = %err, "backend unreachable, create queued");
                        queue.enqueue(Mutation::Create {
                            temp_id: temp_id.to_string(),
                            item: item.clone(),
                        });
                        Ok(item)
                    }
                    _ => Ok(record),
                };
            }
            match err {
                SyncError::RemoteRejected { .. } => lock(&self.store).remove(&target).is_some(),
                // The backend may have stored it; the next refresh settles it.
                _ => false,
            }
        };
        warn!(temp_id, error = %err, "backend refused new order");
        if rolled_back {
            self.publish_local();
        }
        Err(err)
    }

    /// Put back the pre-edit record after the backend refused the edit,
    /// unless the order was edited or deleted again in the meantime.
    fn restore_edit(&self, server_id: &str, sent: &OrderRecord, previous: OrderRecord, err: &SyncError) {
        let target = RecordId::Server(server_id.to_string());
        let restored = {
            let queue = lock(&self.queue);
            let mut store = lock(&self.store);
            let untouched = store.get(&target) == Some(sent)
                && !queue.has_pending_delete(&target)
                && queue.pending_update_for(server_id).is_none();
            if untouched {
                store.upsert(Some(&target), previous);
            }
            untouched
        };
        warn!(order = %target, error = %err, restored, "backend refused edit");
        if restored {
            self.publish_local();
        }
    }

    /// Put back an order whose delete the backend refused.
    fn restore_deleted(&self, removed: OrderRecord, err: &SyncError) {
        let Some(target) = removed.identity() else {
            return;
        };
        let restored = {
            let queue = lock(&self.queue);
            let mut store = lock(&self.store);
            let gone = !store.contains(&target) && !queue.has_pending_delete(&target);
            if gone {
                store.upsert(None, removed);
            }
            gone
        };
        warn!(order = %target, error = %err, restored, "backend refused delete");
        if restored {
            self.publish_local();
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    /// An edit to an order the backend has not confirmed yet.
    fn queue_temp_edit(&self, queue: &mut MutationQueue, temp: String, record: &OrderRecord) {
        if queue.rewrite_pending_create(&temp, record) {
            return;
        }
        let create_running =
            queue.has_pending_create(&temp) || lock(&self.inflight).active.contains(&temp);
        if create_running {
            queue.enqueue(Mutation::Update {
                target: RecordId::Temp(temp),
                item: record.clone(),
            });
        } else {
            // Its create was refused earlier; try again with the edited fields.
            queue.enqueue(Mutation::Create {
                temp_id: temp,
                item: record.clone(),
            });
        }
    }

    fn try_claim(&self, create: Option<&str>) -> Option<SenderGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SenderGuard {
                engine: self,
                create: create.map(str::to_string),
            })
    }

    /// Send a fresh mutation right away only when it cannot overtake
    /// anything already queued.
    fn claim_immediate(&self, queue: &MutationQueue, create: Option<&str>) -> Option<SenderGuard<'_>> {
        if !queue.is_empty() || !self.remote.reachability().is_reachable() {
            return None;
        }
        self.try_claim(create)
    }

    async fn drain_if_reachable(&self) {
        let pending = !lock(&self.queue).is_empty();
        if pending && self.remote.reachability().is_reachable() {
            self.drain_queue().await;
        }
    }

    // -- backend alignment --------------------------------------------------

    /// Align the store with the backend list when it has drifted. A malformed
    /// list leaves the store untouched.
    pub async fn refresh_from_backend(&self) -> SyncResult<RefreshOutcome> {
        let generation = self.writes.load(Ordering::Acquire);
        let backend = match self.remote.list().await {
            Ok(list) => list,
            Err(e) => {
                if matches!(e, SyncError::Protocol(_)) {
                    warn!(error = %e, "backend list malformed, keeping cached orders");
                }
                return Err(e);
            }
        };
        let outcome = {
            let queue = lock(&self.queue);
            // The list may predate a write acknowledged while it was fetched.
            if self.busy.load(Ordering::Acquire) || self.writes.load(Ordering::Acquire) != generation {
                debug!("writes in flight, deferring drift check");
                return Ok(RefreshOutcome::Deferred);
            }
            let inflight = lock(&self.inflight);
            let mut store = lock(&self.store);
            let target = overlay_backend_list(backend, store.list(), &queue, &inflight.active);
            if has_drifted(store.list(), &target) {
                let records = target.len();
                store.replace_list(target);
                RefreshOutcome::Replaced { records }
            } else {
                RefreshOutcome::Unchanged
            }
        };
        if let RefreshOutcome::Replaced { records } = outcome {
            info!(records, "local orders replaced with backend list");
            self.publish_local();
        }
        Ok(outcome)
    }

    /// Probe `/health`; returns the resulting reachability.
    pub async fn health_check(&self) -> ServerStatus {
        if let Err(e) = self.remote.health().await {
            debug!(error = %e, "health probe failed");
        }
        self.status()
    }

    // -- push ---------------------------------------------------------------

    pub fn publish_local(&self) {
        let snapshot = lock(&self.store).snapshot();
        self.push.publish_snapshot(&snapshot);
    }

    pub fn announce(&self) {
        let last_updated = lock(&self.store).last_updated();
        self.push.announce(last_updated);
    }

    /// Route incoming push events into this engine until the subscription
    /// is dropped.
    pub fn subscribe_push(self: &Arc<Self>) -> Subscription {
        let engine = Arc::downgrade(self);
        self.push.on_receive(move |event| {
            if let Some(engine) = engine.upgrade() {
                engine.handle_push_event(event);
            }
        })
    }

    pub fn handle_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::Hello {
                origin_client,
                last_updated,
            } => {
                if origin_client == self.client_id {
                    return;
                }
                let local = lock(&self.store).last_updated();
                if local > last_updated {
                    debug!(peer = %origin_client, "peer is behind, answering hello");
                    self.publish_local();
                }
            }
            PushEvent::Sync(incoming) | PushEvent::Full(incoming) => self.merge_incoming(incoming),
            PushEvent::OrderCreated(record) => self.apply_remote_record(record, false),
            PushEvent::OrderUpdated(record) => self.apply_remote_record(record, true),
            PushEvent::OrderDeleted(server_id) => {
                let target = RecordId::Server(server_id);
                if lock(&self.store).remove(&target).is_some() {
                    debug!(order = %target, "order removed by push event");
                }
            }
        }
    }

    fn merge_incoming(&self, incoming: IncomingSnapshot) {
        let origin = incoming.origin_client.clone().unwrap_or_else(|| "relay".into());
        let last_updated = incoming.last_updated;
        let decision = {
            let mut store = lock(&self.store);
            let decision = merge_snapshot(store.last_updated(), &incoming, &self.client_id);
            if decision == MergeDecision::Adopt {
                store.replace_snapshot(Snapshot {
                    list: incoming.list,
                    last_updated,
                });
            }
            decision
        };
        match decision {
            MergeDecision::Adopt => info!(from = %origin, last_updated, "adopted newer snapshot"),
            MergeDecision::Republish => {
                debug!(from = %origin, last_updated, "peer snapshot is stale, republishing");
                self.publish_local();
            }
            MergeDecision::Keep | MergeDecision::IgnoreOwn => {}
        }
    }

    fn apply_remote_record(&self, record: OrderRecord, is_update: bool) {
        let Some(server_id) = record.server_id.clone() else {
            return;
        };
        let target = RecordId::Server(server_id.clone());
        let queue = lock(&self.queue);
        if queue.has_pending_delete(&target) {
            debug!(order = %target, "ignoring push for an order deleted locally");
            return;
        }
        if is_update && queue.pending_update_for(&server_id).is_some() {
            return;
        }
        let mut store = lock(&self.store);
        if !is_update && store.contains(&target) {
            return;
        }
        let temp_id = record.temp_id.clone();
        store.reconcile_confirmed(temp_id.as_deref(), record, true);
    }

    // -- background loop ----------------------------------------------------

    /// One pass: push queued writes, then check the backend list for drift.
    pub async fn run_sync_cycle(&self) {
        let report = self.drain_queue().await;
        if report.halted {
            return;
        }
        if let Err(e) = self.refresh_from_backend().await {
            debug!(error = %e, "drift check skipped");
        }
    }

    /// Probe, drain and refresh every `interval` until `cancel` fires.
    pub fn start_sync_loop(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Sync loop started");
            engine.announce();
            let mut previous_online: Option<bool> = None;

            loop {
                let tick = async {
                    let online = engine.health_check().await != ServerStatus::Offline;
                    if !online {
                        if previous_online != Some(false) {
                            info!("Backend offline; deferring remote sync and keeping queue pending");
                        }
                        previous_online = Some(false);
                        return;
                    }
                    if previous_online == Some(false) {
                        info!("Backend restored; resuming queued sync");
                    }
                    previous_online = Some(true);
                    engine.run_sync_cycle().await;
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tick => {}
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Sync loop stopped");
        })
    }
}
