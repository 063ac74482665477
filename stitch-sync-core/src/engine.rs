//! The reconciliation engine: remote-to-local and local-to-remote passes,
//! conflict detection and resolution, batched commits. This is where the
//! rest of the crate's leaf components (version model, undo journal, stream
//! listener pool) get wired together.

use crate::clock::LogicalClock;
use crate::config::{document_key, CoreDocumentSynchronizationConfig, NamespaceSynchronizationConfig};
use crate::conflict::{ConflictHandler, ConflictResolution};
use crate::event::{ChangeEvent, OperationType};
use crate::namespace::MongoNamespace;
use crate::pool::ListenerPool;
use crate::traits::{AuthClient, BatchOps, DocumentCodec, LocalStore, NetworkMonitor, RemoteStore};
use crate::undo::UndoJournal;
use crate::version::{
    embed_version, get_remote_version_info, has_committed_version, next_version, sanitize,
    sanitized, DocumentVersion, SYNC_PROTOCOL_VERSION,
};
use crate::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Tunables for the reconciliation loop. Durations mirror the periodic
/// runner's back-off, not the engine itself, but live here since they are
/// the whole of what a caller can configure about a pass.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sleep_after_success: Duration,
    pub sleep_after_failure: Duration,
    /// Soft cap on accumulated local-write batch size before it is flushed.
    pub batch_bytes_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sleep_after_success: Duration::from_millis(500),
            sleep_after_failure: Duration::from_millis(5000),
            batch_bytes_cap: 5 * 1024 * 1024,
        }
    }
}

/// A document-level failure surfaced to the user's error listener. The
/// affected document is paused and excluded from sync until resumed.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub namespace: MongoNamespace,
    pub document_id: Value,
    pub message: String,
}

pub(crate) struct NamespaceRuntime<D> {
    pub(crate) conflict_handler: Arc<dyn ConflictHandler<D>>,
    pub(crate) codec: Arc<dyn DocumentCodec<D>>,
    pub(crate) config: RwLock<NamespaceSynchronizationConfig>,
}

enum R2LAction {
    Deferred,
    Dropped,
    Desynced,
    Apply(ChangeEvent),
    Conflict(ChangeEvent),
}

enum PushOutcome {
    Applied(DocumentVersion),
    DesyncAfterDelete,
    DroppedEmptyDiff,
    Conflict(Option<Value>),
}

/// Owns every namespace's sync state and drives the R2L/L2R passes. Generic
/// over the user's document type `D`, used only at the conflict-resolver
/// boundary — everything else moves sanitized `serde_json::Value`.
pub struct SyncEngine<D> {
    config: EngineConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthClient>,
    network: Arc<dyn NetworkMonitor>,
    pool: ListenerPool,
    undo: UndoJournal,
    clock: LogicalClock,
    namespaces: RwLock<HashMap<MongoNamespace, NamespaceRuntime<D>>>,
    sync_lock: Mutex<()>,
    change_listeners: RwLock<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    error_listeners: RwLock<Vec<mpsc::UnboundedSender<EngineError>>>,
    /// Last-observed network+auth reachability, used to detect the up-edge
    /// that must reopen every change stream (§4.2).
    online: AtomicBool,
}

impl<D> SyncEngine<D>
where
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthClient>,
        network: Arc<dyn NetworkMonitor>,
        config: EngineConfig,
    ) -> Self {
        SyncEngine {
            config,
            local: local.clone(),
            remote,
            auth,
            network,
            pool: ListenerPool::new(),
            undo: UndoJournal::new(local),
            clock: LogicalClock::new(),
            namespaces: RwLock::new(HashMap::new()),
            sync_lock: Mutex::new(()),
            change_listeners: RwLock::new(Vec::new()),
            error_listeners: RwLock::new(Vec::new()),
            online: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    pub(crate) fn undo(&self) -> &UndoJournal {
        &self.undo
    }

    pub(crate) fn namespaces(&self) -> &RwLock<HashMap<MongoNamespace, NamespaceRuntime<D>>> {
        &self.namespaces
    }

    pub async fn add_change_listener(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.change_listeners.write().await.push(tx);
        rx
    }

    pub async fn add_error_listener(&self) -> mpsc::UnboundedReceiver<EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.error_listeners.write().await.push(tx);
        rx
    }

    pub(crate) async fn emit_change(&self, event: ChangeEvent) {
        let mut listeners = self.change_listeners.write().await;
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) async fn emit_error(&self, ns: &MongoNamespace, id: &Value, err: SyncError) {
        tracing::error!(namespace = %ns, document_id = %id, error = %err, "sync error");
        let engine_err = EngineError {
            namespace: ns.clone(),
            document_id: id.clone(),
            message: err.to_string(),
        };
        let mut listeners = self.error_listeners.write().await;
        listeners.retain(|tx| tx.send(engine_err.clone()).is_ok());
    }

    /// Begins synchronizing `ids` in `ns`, installing the namespace's
    /// conflict handler and codec on first use. Safe to call repeatedly to
    /// grow the watched id set.
    pub async fn sync(
        &self,
        ns: MongoNamespace,
        ids: Vec<Value>,
        conflict_handler: Arc<dyn ConflictHandler<D>>,
        codec: Arc<dyn DocumentCodec<D>>,
    ) -> SyncResult<()> {
        let _guard = self.sync_lock.lock().await;
        {
            let mut namespaces = self.namespaces.write().await;
            let runtime = namespaces.entry(ns.clone()).or_insert_with(|| NamespaceRuntime {
                conflict_handler,
                codec,
                config: RwLock::new(NamespaceSynchronizationConfig::default()),
            });
            let mut cfg = runtime.config.write().await;
            for id in &ids {
                cfg.documents
                    .entry(document_key(id))
                    .or_insert_with(|| CoreDocumentSynchronizationConfig::new(id.clone()));
            }
            cfg.is_stale = true;
        }
        self.restart_listener(&ns).await
    }

    /// Stops synchronizing one document: removes its config. The underlying
    /// local document is left in place.
    pub async fn desync(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()> {
        let _guard = self.sync_lock.lock().await;
        if let Some(runtime) = self.namespaces.read().await.get(ns) {
            runtime.config.write().await.documents.remove(&document_key(id));
        }
        self.restart_listener(ns).await
    }

    pub(crate) async fn restart_listener(&self, ns: &MongoNamespace) -> SyncResult<()> {
        let ids = match self.namespaces.read().await.get(ns) {
            Some(runtime) => runtime.config.read().await.synchronized_ids(),
            None => vec![],
        };
        let listener = self.pool.add_namespace(ns.clone()).await;
        listener
            .start(self.remote.clone(), self.auth.clone(), self.network.clone(), ids)
            .await?;
        Ok(())
    }

    pub async fn pause_document(&self, ns: &MongoNamespace, id: &Value) {
        if let Some(runtime) = self.namespaces.read().await.get(ns) {
            let mut cfg = runtime.config.write().await;
            if let Some(doc) = cfg.documents.get_mut(&document_key(id)) {
                doc.pause();
            }
        }
    }

    pub async fn resume_document(&self, ns: &MongoNamespace, id: &Value) {
        if let Some(runtime) = self.namespaces.read().await.get(ns) {
            let mut cfg = runtime.config.write().await;
            if let Some(doc) = cfg.documents.get_mut(&document_key(id)) {
                doc.resume();
            }
        }
    }

    pub async fn paused_document_ids(&self, ns: &MongoNamespace) -> Vec<Value> {
        match self.namespaces.read().await.get(ns) {
            Some(runtime) => runtime
                .config
                .read()
                .await
                .documents
                .values()
                .filter(|d| d.is_paused)
                .map(|d| d.document_id.clone())
                .collect(),
            None => vec![],
        }
    }

    /// Runs the four-step crash recovery protocol (§4.8) for every
    /// configured namespace. Must run to completion before the first sync
    /// pass after a restart.
    pub async fn recover(&self) -> SyncResult<()> {
        let namespaces: Vec<MongoNamespace> = self.namespaces.read().await.keys().cloned().collect();
        for ns in namespaces {
            let guard = self.namespaces.read().await;
            if let Some(runtime) = guard.get(&ns) {
                let cfg = runtime.config.read().await;
                crate::recovery::recover_namespace(&self.local, &self.undo, &ns, &cfg.documents).await?;
            }
        }
        Ok(())
    }

    /// Runs one full reconciliation: R2L then L2R, for every namespace.
    /// Deliberately does not hold a single crate-wide lock across remote
    /// I/O — each namespace's own stream/config locks provide the ordering
    /// guarantees instead.
    pub async fn do_sync_pass(&self) -> SyncResult<()> {
        let reachable = self.network.is_connected() && self.auth.is_logged_in().await;
        let was_online = self.online.swap(reachable, Ordering::SeqCst);
        if reachable && !was_online {
            tracing::info!("network/auth up-edge, reopening change streams");
            self.reopen_listeners().await?;
        }

        let logical_t = self.clock.tick();
        let namespaces: Vec<MongoNamespace> = self.namespaces.read().await.keys().cloned().collect();
        for ns in namespaces {
            self.r2l_pass(&ns, logical_t).await?;
            self.l2r_pass(&ns, logical_t).await?;
        }
        Ok(())
    }

    /// Reopens every namespace's change stream on a network or auth up-edge
    /// (§4.2's restart policy). A freshly (re)started `StreamListener` marks
    /// itself stale, which `r2l_pass` turns into the required full-document
    /// catch-up fetch on the next pass.
    async fn reopen_listeners(&self) -> SyncResult<()> {
        let namespaces = self.namespaces.read().await;
        let mut ids_by_namespace = HashMap::with_capacity(namespaces.len());
        for (ns, runtime) in namespaces.iter() {
            ids_by_namespace.insert(ns.clone(), runtime.config.read().await.synchronized_ids());
        }
        drop(namespaces);

        self.pool
            .start_all(self.remote.clone(), self.auth.clone(), self.network.clone(), &ids_by_namespace)
            .await
    }

    async fn r2l_pass(&self, ns: &MongoNamespace, logical_t: i64) -> SyncResult<()> {
        let namespaces = self.namespaces.read().await;
        let Some(runtime) = namespaces.get(ns) else { return Ok(()) };
        let Some(listener) = self.pool.get(ns).await else { return Ok(()) };

        // Stream lock, then config lock — never the reverse.
        let events = listener.get_events().await;
        let mut cfg = runtime.config.write().await;

        // A listener that was just (re)opened — e.g. by a network/auth
        // up-edge or an id-set change — marks itself stale; treat that the
        // same as the namespace's own `is_stale` flag so a restarted stream
        // always gets the full-document catch-up.
        let listener_stale = listener.is_stale();
        let stale = cfg.is_stale || listener_stale;
        cfg.is_stale = false;
        if listener_stale {
            listener.clear_stale();
        }
        let stale_ids: Vec<Value> = if stale {
            cfg.documents.values().map(|d| d.document_id.clone()).collect()
        } else {
            vec![]
        };

        let remote_docs: HashMap<String, Value> = if stale_ids.is_empty() {
            HashMap::new()
        } else {
            self.remote
                .find(ns, &stale_ids)
                .await?
                .into_iter()
                .map(|d| (document_key(&d.get("_id").cloned().unwrap_or(Value::Null)), d))
                .collect()
        };

        let mut work = events;
        for id in &stale_ids {
            let key = document_key(id);
            if work.contains_key(&key) {
                continue;
            }
            let synthesized = match remote_docs.get(&key) {
                Some(doc) => ChangeEvent::replace(ns.clone(), id.clone(), doc.clone()),
                None => ChangeEvent::delete(ns.clone(), id.clone()),
            };
            work.insert(key, synthesized);
        }

        let mut batch = BatchOps::default();
        let mut touched: Vec<Value> = Vec::new();
        let mut desynced: Vec<String> = Vec::new();
        let mut conflicts: Vec<(String, ChangeEvent)> = Vec::new();

        for (key, event) in work {
            let Some(doc_config) = cfg.documents.get_mut(&key) else { continue };
            if doc_config.is_paused {
                continue;
            }

            match self.route_r2l_event(ns, doc_config, event, logical_t).await? {
                R2LAction::Deferred | R2LAction::Dropped => {}
                R2LAction::Desynced => desynced.push(key),
                R2LAction::Apply(event) => {
                    if event.operation == OperationType::Delete {
                        batch.push_delete(doc_config.document_id.clone());
                        touched.push(doc_config.document_id.clone());
                        desynced.push(key);
                    } else {
                        let remote_version = event
                            .full_document
                            .as_ref()
                            .and_then(|d| get_remote_version_info(d).ok().flatten());
                        let doc = sanitized(event.full_document.as_ref().unwrap());
                        touched.push(doc_config.document_id.clone());
                        batch.push_upsert(doc_config.document_id.clone(), doc);
                        doc_config.last_known_remote_version = remote_version;
                    }
                    self.emit_change(event.committed()).await;
                }
                R2LAction::Conflict(remote_event) => conflicts.push((key, remote_event)),
            }

            if batch.approx_bytes() >= self.config.batch_bytes_cap {
                self.commit_batch(ns, std::mem::take(&mut batch), &mut touched).await?;
            }
        }

        if !batch.is_empty() {
            self.commit_batch(ns, batch, &mut touched).await?;
        }

        for key in desynced {
            cfg.documents.remove(&key);
        }

        for (key, remote_event) in conflicts {
            let desync = {
                let Some(doc_config) = cfg.documents.get_mut(&key) else { continue };
                if doc_config.is_paused {
                    continue;
                }
                self.resolve_conflict(ns, runtime, doc_config, remote_event, logical_t).await?
            };
            if desync {
                cfg.documents.remove(&key);
            }
        }

        Ok(())
    }

    async fn route_r2l_event(
        &self,
        ns: &MongoNamespace,
        doc_config: &mut CoreDocumentSynchronizationConfig,
        event: ChangeEvent,
        logical_t: i64,
    ) -> SyncResult<R2LAction> {
        if doc_config.has_uncommitted_writes && doc_config.last_resolution == logical_t {
            return Ok(R2LAction::Deferred);
        }

        let remote_version = match event.full_document.as_ref().map(|d| get_remote_version_info(d)) {
            Some(Ok(v)) => v,
            Some(Err(e)) => {
                self.emit_error(ns, &doc_config.document_id, e).await;
                return Ok(R2LAction::Desynced);
            }
            None => None,
        };

        if let Some(v) = &remote_version {
            if v.sync_protocol_version != SYNC_PROTOCOL_VERSION {
                self.emit_error(
                    ns,
                    &doc_config.document_id,
                    SyncError::VersionParseError(format!(
                        "unsupported sync protocol version {}",
                        v.sync_protocol_version
                    )),
                )
                .await;
                return Ok(R2LAction::Desynced);
            }
        }

        if has_committed_version(doc_config.last_known_remote_version.as_ref(), remote_version.as_ref()) {
            return Ok(R2LAction::Dropped);
        }

        if doc_config.last_uncommitted_change_event.is_none() {
            return Ok(R2LAction::Apply(event));
        }

        match (doc_config.last_known_remote_version.clone(), remote_version) {
            (None, _) | (_, None) => Ok(R2LAction::Conflict(event)),
            (Some(local), Some(remote)) if local.instance_id == remote.instance_id => {
                if remote.version_counter <= local.version_counter {
                    Ok(R2LAction::Dropped)
                } else {
                    Ok(R2LAction::Conflict(event))
                }
            }
            (Some(local), Some(_)) => match self.remote.find_one(ns, &doc_config.document_id).await? {
                None => Ok(R2LAction::Conflict(ChangeEvent::delete(ns.clone(), doc_config.document_id.clone()))),
                Some(doc) => {
                    let newest_version = get_remote_version_info(&doc)?;
                    if newest_version.map(|v| v.instance_id) == Some(local.instance_id) {
                        Ok(R2LAction::Dropped)
                    } else {
                        Ok(R2LAction::Conflict(ChangeEvent::replace(ns.clone(), doc_config.document_id.clone(), doc)))
                    }
                }
            },
        }
    }

    async fn commit_batch(&self, ns: &MongoNamespace, batch: BatchOps, touched: &mut Vec<Value>) -> SyncResult<()> {
        for id in touched.iter() {
            if let Some(pre_image) = self.local.find_one(ns, id).await? {
                self.local.insert_undo(ns, id, pre_image).await?;
            }
        }
        self.local.bulk_write(ns, batch).await?;
        for id in touched.drain(..) {
            self.local.delete_undo(ns, &id).await?;
        }
        Ok(())
    }

    async fn l2r_pass(&self, ns: &MongoNamespace, logical_t: i64) -> SyncResult<()> {
        let namespaces = self.namespaces.read().await;
        let Some(runtime) = namespaces.get(ns) else { return Ok(()) };
        let Some(listener) = self.pool.get(ns).await else { return Ok(()) };

        let mut cfg = runtime.config.write().await;
        let pending_keys: Vec<String> = cfg
            .documents
            .iter()
            .filter(|(_, d)| d.has_uncommitted_writes && !d.is_paused && d.last_resolution != logical_t)
            .map(|(k, _)| k.clone())
            .collect();

        for key in pending_keys {
            let Some(id) = cfg.documents.get(&key).map(|d| d.document_id.clone()) else {
                continue;
            };

            if let Some(unprocessed) = listener.get_unprocessed_event(&id).await {
                let remote_version = unprocessed
                    .full_document
                    .as_ref()
                    .and_then(|d| get_remote_version_info(d).ok().flatten());
                let already_committed = cfg
                    .documents
                    .get(&key)
                    .map(|d| has_committed_version(d.last_known_remote_version.as_ref(), remote_version.as_ref()))
                    .unwrap_or(false);

                if !already_committed {
                    let desync = {
                        let Some(doc_config) = cfg.documents.get_mut(&key) else { continue };
                        self.resolve_conflict(ns, runtime, doc_config, unprocessed, logical_t).await?
                    };
                    if desync {
                        cfg.documents.remove(&key);
                    }
                    continue;
                }
            }

            let Some(doc_config) = cfg.documents.get(&key).cloned() else { continue };
            let Some(event) = doc_config.last_uncommitted_change_event.clone() else { continue };

            match self.push_local_change(ns, &doc_config, &event).await {
                Ok(PushOutcome::Applied(new_version)) => {
                    if let Some(doc_config) = cfg.documents.get_mut(&key) {
                        doc_config.clear_pending(new_version);
                    }
                    self.emit_change(event.committed()).await;
                }
                Ok(PushOutcome::DesyncAfterDelete) => {
                    cfg.documents.remove(&key);
                    self.emit_change(event.committed()).await;
                }
                Ok(PushOutcome::DroppedEmptyDiff) => {
                    if let Some(doc_config) = cfg.documents.get_mut(&key) {
                        doc_config.drop_pending();
                    }
                }
                Ok(PushOutcome::Conflict(remote_doc)) => {
                    let conflict_event = match remote_doc {
                        Some(doc) => ChangeEvent::replace(ns.clone(), id.clone(), doc),
                        None => ChangeEvent::delete(ns.clone(), id.clone()),
                    };
                    let desync = {
                        let Some(doc_config) = cfg.documents.get_mut(&key) else { continue };
                        self.resolve_conflict(ns, runtime, doc_config, conflict_event, logical_t).await?
                    };
                    if desync {
                        cfg.documents.remove(&key);
                    }
                }
                Err(e) => {
                    if let Some(doc_config) = cfg.documents.get_mut(&key) {
                        doc_config.pause();
                    }
                    self.emit_error(ns, &id, e).await;
                }
            }
        }

        Ok(())
    }

    async fn push_local_change(
        &self,
        ns: &MongoNamespace,
        doc_config: &CoreDocumentSynchronizationConfig,
        event: &ChangeEvent,
    ) -> SyncResult<PushOutcome> {
        let id = &doc_config.document_id;
        match event.operation {
            OperationType::Insert => {
                let new_version = DocumentVersion::fresh();
                let mut doc = event.full_document.clone().unwrap_or_else(|| Value::Object(Default::default()));
                embed_version(&mut doc, &new_version);
                match self.remote.insert_one(ns, doc).await {
                    Ok(()) => Ok(PushOutcome::Applied(new_version)),
                    Err(SyncError::DuplicateKey(_)) => Ok(PushOutcome::Conflict(self.remote.find_one(ns, id).await?)),
                    Err(e) => Err(e),
                }
            }
            OperationType::Replace => {
                let new_version = next_version(doc_config.last_known_remote_version.as_ref());
                let mut doc = event.full_document.clone().unwrap_or_else(|| Value::Object(Default::default()));
                embed_version(&mut doc, &new_version);
                let matched = self
                    .remote
                    .replace_one(ns, id, doc_config.last_known_remote_version.as_ref(), doc)
                    .await?;
                if matched > 0 {
                    Ok(PushOutcome::Applied(new_version))
                } else {
                    Ok(PushOutcome::Conflict(self.remote.find_one(ns, id).await?))
                }
            }
            OperationType::Update => {
                let Some(desc) = &event.update_description else {
                    return Ok(PushOutcome::DroppedEmptyDiff);
                };
                if desc.is_empty() {
                    return Ok(PushOutcome::DroppedEmptyDiff);
                }
                let new_version = next_version(doc_config.last_known_remote_version.as_ref());
                let mut set = desc.updated_fields.clone();
                set.insert(
                    crate::version::VERSION_FIELD.to_string(),
                    serde_json::to_value(&new_version).expect("DocumentVersion always serializes"),
                );
                let matched = self
                    .remote
                    .update_one(
                        ns,
                        id,
                        doc_config.last_known_remote_version.as_ref(),
                        set,
                        desc.removed_fields.clone(),
                    )
                    .await?;
                if matched > 0 {
                    Ok(PushOutcome::Applied(new_version))
                } else {
                    Ok(PushOutcome::Conflict(self.remote.find_one(ns, id).await?))
                }
            }
            OperationType::Delete => {
                let deleted = self
                    .remote
                    .delete_one(ns, id, doc_config.last_known_remote_version.as_ref())
                    .await?;
                if deleted > 0 {
                    return Ok(PushOutcome::DesyncAfterDelete);
                }
                match self.remote.find_one(ns, id).await? {
                    Some(doc) => Ok(PushOutcome::Conflict(Some(doc))),
                    None => Ok(PushOutcome::DesyncAfterDelete),
                }
            }
        }
    }

    /// Runs the user's conflict handler and applies its resolution (§4.7).
    /// Returns whether the caller should remove the document's config
    /// (a fully-accepted remote delete).
    async fn resolve_conflict(
        &self,
        ns: &MongoNamespace,
        runtime: &NamespaceRuntime<D>,
        doc_config: &mut CoreDocumentSynchronizationConfig,
        remote_event: ChangeEvent,
        logical_t: i64,
    ) -> SyncResult<bool> {
        let Some(local_event) = doc_config.last_uncommitted_change_event.clone() else {
            doc_config.last_resolution = logical_t;
            return Ok(false);
        };

        let sanitized_local = sanitize_event(&local_event);
        let sanitized_remote = sanitize_event(&remote_event);

        let resolution = match runtime
            .conflict_handler
            .resolve(&doc_config.document_id, &sanitized_local, &sanitized_remote)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                doc_config.pause();
                doc_config.last_resolution = logical_t;
                self.emit_error(ns, &doc_config.document_id, e).await;
                return Ok(false);
            }
        };

        let remote_version = remote_event
            .full_document
            .as_ref()
            .and_then(|d| get_remote_version_info(d).ok().flatten());
        let remote_doc_sanitized = remote_event.full_document.as_ref().map(sanitized);

        let desync = match resolution {
            ConflictResolution::Delete => {
                let accept_remote = remote_doc_sanitized.is_none();
                let pre_image = self.local.find_one(ns, &doc_config.document_id).await?;
                let id = doc_config.document_id.clone();
                self.undo
                    .guarded(ns, &id, pre_image, || self.local.delete(ns, &id))
                    .await?;

                if accept_remote {
                    self.emit_change(ChangeEvent::delete(ns.clone(), doc_config.document_id.clone()).committed())
                        .await;
                    true
                } else {
                    doc_config.last_known_remote_version = remote_version;
                    let event = ChangeEvent::delete(ns.clone(), doc_config.document_id.clone());
                    doc_config.set_pending(event.clone());
                    self.emit_change(event).await;
                    false
                }
            }
            ConflictResolution::Replace(resolved) => {
                let resolved_doc = runtime.codec.encode(&resolved)?;
                let accept_remote = remote_doc_sanitized.as_ref() == Some(&resolved_doc);
                let pre_image = self.local.find_one(ns, &doc_config.document_id).await?;
                let id = doc_config.document_id.clone();
                let doc_for_write = resolved_doc.clone();
                self.undo
                    .guarded(ns, &id, pre_image, || self.local.upsert(ns, &id, doc_for_write))
                    .await?;

                if accept_remote {
                    doc_config.last_known_remote_version = remote_version;
                    doc_config.last_uncommitted_change_event = None;
                    doc_config.has_uncommitted_writes = false;
                    self.emit_change(
                        ChangeEvent::replace(ns.clone(), doc_config.document_id.clone(), resolved_doc).committed(),
                    )
                    .await;
                } else {
                    doc_config.last_known_remote_version = remote_version;
                    let event = if remote_event.full_document.is_none() {
                        ChangeEvent::insert(ns.clone(), doc_config.document_id.clone(), resolved_doc.clone())
                    } else {
                        ChangeEvent::update(
                            ns.clone(),
                            doc_config.document_id.clone(),
                            resolved_doc.clone(),
                            Default::default(),
                        )
                    };
                    doc_config.set_pending(event.clone());
                    self.emit_change(event).await;
                }
                false
            }
        };

        doc_config.last_resolution = logical_t;
        Ok(desync)
    }
}

fn sanitize_event(event: &ChangeEvent) -> ChangeEvent {
    let mut clone = event.clone();
    if let Some(doc) = &mut clone.full_document {
        sanitize(doc);
    }
    clone
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::RemoteWins;
    use crate::testutil::{InMemoryLocalStore, InMemoryRemoteStore};
    use crate::traits::JsonCodec;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    struct Doc {
        #[serde(rename = "_id")]
        id: i64,
        x: String,
    }

    struct AlwaysOnline;
    #[async_trait::async_trait]
    impl AuthClient for AlwaysOnline {
        async fn is_logged_in(&self) -> bool {
            true
        }
        async fn refresh_token(&self) -> SyncResult<()> {
            Ok(())
        }
    }
    impl NetworkMonitor for AlwaysOnline {
        fn is_connected(&self) -> bool {
            true
        }
        fn subscribe(&self) -> tokio::sync::watch::Receiver<bool> {
            tokio::sync::watch::channel(true).1
        }
    }

    fn build_engine() -> (
        Arc<SyncEngine<Doc>>,
        Arc<InMemoryLocalStore>,
        Arc<InMemoryRemoteStore>,
    ) {
        let local = Arc::new(InMemoryLocalStore::new());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = Arc::new(SyncEngine::new(
            local.clone(),
            remote.clone(),
            Arc::new(AlwaysOnline),
            Arc::new(AlwaysOnline),
            EngineConfig::default(),
        ));
        (engine, local, remote)
    }

    #[tokio::test]
    async fn clean_insert_round_trips_to_remote() {
        let (engine, local, remote) = build_engine();
        let ns = MongoNamespace::new("t", "c");
        engine.sync(ns.clone(), vec![], Arc::new(RemoteWins), Arc::new(JsonCodec)).await.unwrap();

        engine.insert_one(&ns, json!({"_id": 1, "x": "a"})).await.unwrap();
        engine.do_sync_pass().await.unwrap();
        engine.do_sync_pass().await.unwrap();

        let remote_doc = remote.get(&ns, &json!(1)).unwrap();
        assert_eq!(remote_doc["x"], "a");
        assert!(remote_doc.get(crate::version::VERSION_FIELD).is_some());

        let local_doc = local.get(&ns, &json!(1)).unwrap();
        assert_eq!(local_doc, json!({"_id": 1, "x": "a"}));
    }

    #[tokio::test]
    async fn empty_update_diff_makes_no_remote_call() {
        let (engine, _local, remote) = build_engine();
        let ns = MongoNamespace::new("t", "c");
        engine.sync(ns.clone(), vec![], Arc::new(RemoteWins), Arc::new(JsonCodec)).await.unwrap();
        engine.insert_one(&ns, json!({"_id": 1, "x": "a"})).await.unwrap();
        engine.do_sync_pass().await.unwrap();
        engine.do_sync_pass().await.unwrap();

        let before = remote.get(&ns, &json!(1)).unwrap();

        engine.update_one(&ns, &json!(1), json!({"_id": 1, "x": "a"})).await.unwrap();
        engine.do_sync_pass().await.unwrap();

        let after = remote.get(&ns, &json!(1)).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn insert_then_delete_offline_coalesces_to_no_remote_call() {
        let (engine, local, remote) = build_engine();
        let ns = MongoNamespace::new("t", "c");
        engine.sync(ns.clone(), vec![], Arc::new(RemoteWins), Arc::new(JsonCodec)).await.unwrap();

        engine.insert_one(&ns, json!({"_id": 2, "x": "a"})).await.unwrap();
        engine.delete_one(&ns, &json!(2)).await.unwrap();
        engine.do_sync_pass().await.unwrap();

        assert!(remote.get(&ns, &json!(2)).is_none());
        assert!(local.get(&ns, &json!(2)).is_none());
    }

    #[tokio::test]
    async fn conflicting_update_is_resolved_by_remote_wins() {
        let (engine, local, remote) = build_engine();
        let ns = MongoNamespace::new("t", "c");
        engine.sync(ns.clone(), vec![], Arc::new(RemoteWins), Arc::new(JsonCodec)).await.unwrap();

        engine.insert_one(&ns, json!({"_id": 1, "x": "a"})).await.unwrap();
        engine.do_sync_pass().await.unwrap();
        engine.do_sync_pass().await.unwrap();

        // A local edit is still pending...
        engine.update_one(&ns, &json!(1), json!({"_id": 1, "x": "local"})).await.unwrap();

        // ...while another writer replaces the document remotely first, with
        // a version the local side has never seen.
        let mut remote_doc = json!({"_id": 1, "x": "remote"});
        embed_version(&mut remote_doc, &DocumentVersion::fresh());
        remote.seed(&ns, remote_doc.clone());
        remote.push_event(&ns, ChangeEvent::replace(ns.clone(), json!(1), remote_doc));

        engine.do_sync_pass().await.unwrap();

        // RemoteWins: the conflict is resolved toward the remote content,
        // applied locally, and the local pending write is dropped rather
        // than retried against a version that has already moved on.
        assert_eq!(local.get(&ns, &json!(1)).unwrap()["x"], "remote");
        assert_eq!(remote.get(&ns, &json!(1)).unwrap()["x"], "remote");

        let namespaces = engine.namespaces().read().await;
        let cfg = namespaces.get(&ns).unwrap().config.read().await;
        let doc_config = cfg.documents.get(&document_key(&json!(1))).unwrap();
        assert!(!doc_config.has_uncommitted_writes);
    }

    #[tokio::test]
    async fn malformed_remote_version_desyncs_and_notifies_error_listener() {
        let (engine, _local, remote) = build_engine();
        let ns = MongoNamespace::new("t", "c");
        engine.sync(ns.clone(), vec![json!(1)], Arc::new(RemoteWins), Arc::new(JsonCodec)).await.unwrap();

        let mut errors = engine.add_error_listener().await;

        let mut bad_doc = json!({"_id": 1, "x": "a"});
        bad_doc[crate::version::VERSION_FIELD] = json!("not-an-object");
        remote.seed(&ns, bad_doc.clone());
        remote.push_event(&ns, ChangeEvent::replace(ns.clone(), json!(1), bad_doc));

        engine.do_sync_pass().await.unwrap();

        let err = errors.try_recv().expect("malformed version should raise an engine error");
        assert_eq!(err.namespace, ns);
        assert_eq!(err.document_id, json!(1));

        let namespaces = engine.namespaces().read().await;
        let cfg = namespaces.get(&ns).unwrap().config.read().await;
        assert!(!cfg.documents.contains_key(&document_key(&json!(1))));
    }
}
