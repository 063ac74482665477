use crate::config::document_key;
use crate::event::ChangeEvent;
use crate::namespace::MongoNamespace;
use crate::traits::{AuthClient, NetworkMonitor, RemoteStore};
use crate::SyncResult;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// A failed result delivered to watchers when the listener closes.
pub type WatcherResult = Result<ChangeEvent, ()>;

struct Inner {
    buffer: HashMap<String, ChangeEvent>,
    watchers: HashMap<u64, mpsc::UnboundedSender<WatcherResult>>,
}

/// Owns an open change stream for one namespace: buffers unprocessed events
/// by document id (later events for the same id overwrite earlier ones —
/// coalescence) and fans each stored event out to registered watchers.
///
/// All mutations to the buffer take the namespace's write lock; the sync
/// engine also acquires this lock for the duration of a pass, guaranteeing no
/// ingestion during reconciliation (Invariant 5).
pub struct StreamListener {
    namespace: MongoNamespace,
    inner: Arc<RwLock<Inner>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    next_watcher_id: AtomicU64,
    stale: std::sync::atomic::AtomicBool,
}

impl StreamListener {
    pub fn new(namespace: MongoNamespace) -> Self {
        StreamListener {
            namespace,
            inner: Arc::new(RwLock::new(Inner {
                buffer: HashMap::new(),
                watchers: HashMap::new(),
            })),
            task: std::sync::Mutex::new(None),
            next_watcher_id: AtomicU64::new(0),
            stale: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn clear_stale(&self) {
        self.stale.store(false, Ordering::SeqCst);
    }

    /// Opens the change stream and spawns the dedicated buffering task.
    /// Returns `Ok(false)` without opening anything when disconnected, not
    /// logged in, or the id set is empty — "do-not-open conditions" are
    /// silent, not errors.
    pub async fn start(
        &self,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthClient>,
        network: Arc<dyn NetworkMonitor>,
        ids: Vec<Value>,
    ) -> SyncResult<bool> {
        self.stop().await;

        if !network.is_connected() || !auth.is_logged_in().await || ids.is_empty() {
            return Ok(false);
        }

        let mut stream = remote.open_change_stream(&self.namespace, ids).await?;
        self.stale.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match stream.next_event().await {
                    Ok(Some(event)) => {
                        let mut guard = inner.write().await;
                        guard.buffer.insert(document_key(&event.document_key), event.clone());
                        guard.watchers.retain(|_, tx| tx.send(Ok(event.clone())).is_ok());
                    }
                    Ok(None) => {
                        tracing::info!("change stream closed cleanly");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("change stream error, closing: {}", e);
                        break;
                    }
                }
            }
            let guard = inner.read().await;
            for tx in guard.watchers.values() {
                let _ = tx.send(Err(()));
            }
        });

        *self.task.lock().unwrap() = Some(task);
        Ok(true)
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Atomically snapshots and clears the buffer.
    pub async fn get_events(&self) -> HashMap<String, ChangeEvent> {
        let mut guard = self.inner.write().await;
        std::mem::take(&mut guard.buffer)
    }

    /// Atomically fetches and removes one event, used by L2R to peek at
    /// concurrent remote state.
    pub async fn get_unprocessed_event(&self, id: &Value) -> Option<ChangeEvent> {
        let mut guard = self.inner.write().await;
        guard.buffer.remove(&document_key(id))
    }

    pub async fn add_watcher(&self) -> (u64, mpsc::UnboundedReceiver<WatcherResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        self.inner.write().await.watchers.insert(id, tx);
        (id, rx)
    }

    pub async fn remove_watcher(&self, id: u64) {
        self.inner.write().await.watchers.remove(&id);
    }
}
