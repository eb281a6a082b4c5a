//! Offline-first sync engine for a shared order list.
//!
//! Every mutation lands in the local store first, goes to the orders backend
//! right away when it is reachable and waits in a persisted FIFO queue when it
//! is not. Instances exchange whole-list snapshots over a push channel and
//! converge on the newest one.
//!
//! `OrdersSync` wires one instance together: SQLite state, the HTTP backend
//! client, the push channel and the background sync loop. Several instances
//! can live in one process.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod push;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use logging::init_logging;
pub use model::{OrderDraft, OrderRecord, RecordId, Snapshot};
pub use push::{LocalBus, PushEvent, PushTransport, RawFrame, Subscription};
pub use queue::{EntryState, Mutation, QueueEntry};
pub use remote::{HttpOrdersApi, OrdersApi, ServerStatus};
pub use sync::{DrainReport, RefreshOutcome, SyncEngine};

use push::PushChannel;
use queue::MutationQueue;
use remote::{Reachability, RemoteClient};
use store::LocalStore;

/// One running sync instance.
pub struct OrdersSync {
    engine: Arc<SyncEngine>,
    config: SyncConfig,
    cancel: CancellationToken,
    subscription: Option<Subscription>,
    sync_loop: Option<JoinHandle<()>>,
}

impl OrdersSync {
    /// Open persisted state under `config.data_dir` and talk HTTP to
    /// `config.api_url`. Nothing runs until [`OrdersSync::start`].
    pub fn open(config: SyncConfig, transport: Arc<dyn PushTransport>) -> anyhow::Result<Self> {
        let api = HttpOrdersApi::new(&config.api_url, config.request_timeout, config.health_timeout)
            .context("Failed to build orders backend client")?;
        Self::open_with_api(config, Arc::new(api), transport)
    }

    /// Same as [`OrdersSync::open`] with a caller-supplied backend.
    pub fn open_with_api(
        config: SyncConfig,
        api: Arc<dyn OrdersApi>,
        transport: Arc<dyn PushTransport>,
    ) -> anyhow::Result<Self> {
        let db_path = config.db_path();
        let db = Arc::new(
            db::init(&db_path)
                .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
        );
        let client_id = db::get_or_create_client_id(&db).context("Failed to load client identity")?;

        let store = LocalStore::load(db.clone());
        let queue = MutationQueue::load(db);
        let remote = RemoteClient::new(api, Reachability::new(), config.request_timeout);
        let push = PushChannel::new(client_id.clone(), transport);

        info!(
            client_id = %client_id,
            api_url = %config.api_url,
            orders = store.len(),
            pending = queue.len(),
            "orders sync opened"
        );

        Ok(Self {
            engine: Arc::new(SyncEngine::new(client_id, store, queue, remote, push)),
            config,
            cancel: CancellationToken::new(),
            subscription: None,
            sync_loop: None,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribe to the push channel and spawn the periodic sync loop.
    /// Must be called inside a Tokio runtime. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.sync_loop.is_some() {
            warn!("orders sync already started");
            return;
        }
        self.subscription = Some(self.engine.subscribe_push());
        self.sync_loop = Some(
            self.engine
                .start_sync_loop(self.config.poll_interval, self.cancel.child_token()),
        );
    }

    /// Stop the loop and the push receiver, waiting for both to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(subscription) = self.subscription.take() {
            subscription.shutdown().await;
        }
        if let Some(handle) = self.sync_loop.take() {
            if let Err(e) = handle.await {
                warn!("sync loop ended abnormally: {e}");
            }
        }
        info!(client_id = %self.engine.client_id(), "orders sync shut down");
    }
}

impl Drop for OrdersSync {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
