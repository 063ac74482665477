//! Local-first CRUD (§4.9): every call lands on the local store immediately
//! and stages a pending change event that the next L2R pass pushes out.
//! Coalescence with whatever write is already pending follows the table in
//! §4.9 — repeated local writes to the same document before it has synced
//! collapse into a single intent instead of replaying every intermediate
//! step.

use crate::config::{document_key, CoreDocumentSynchronizationConfig};
use crate::engine::SyncEngine;
use crate::event::{ChangeEvent, OperationType};
use crate::namespace::MongoNamespace;
use crate::version::{sanitize, update_description_diff};
use crate::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

impl<D> SyncEngine<D>
where
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub async fn insert_one(&self, ns: &MongoNamespace, mut doc: Value) -> SyncResult<Value> {
        sanitize(&mut doc);
        let id = doc
            .get("_id")
            .cloned()
            .ok_or_else(|| SyncError::InternalInvariantViolation("insert requires an _id field".into()))?;

        self.local().upsert(ns, &id, doc.clone()).await?;

        let event = {
            let namespaces = self.namespaces().read().await;
            let Some(runtime) = namespaces.get(ns) else {
                return Err(SyncError::InternalInvariantViolation(format!(
                    "namespace {ns} is not configured for sync"
                )));
            };
            let mut cfg = runtime.config.write().await;
            let key = document_key(&id);
            let existing_op = cfg
                .documents
                .get(&key)
                .and_then(|d| d.last_uncommitted_change_event.as_ref().map(|e| e.operation));

            match existing_op {
                Some(op) if op != OperationType::Delete => {
                    return Err(SyncError::InternalInvariantViolation(
                        "cannot insert a document that already has a pending write".into(),
                    ));
                }
                _ => {}
            }

            // A pending DELETE coalesces with a following INSERT into an
            // INSERT that is, semantically, a replace.
            let event = ChangeEvent::insert(ns.clone(), id.clone(), doc.clone());
            let doc_config = cfg
                .documents
                .entry(key)
                .or_insert_with(|| CoreDocumentSynchronizationConfig::new(id.clone()));
            doc_config.set_pending(event.clone());
            event
        };

        self.emit_change(event).await;
        self.restart_listener(ns).await?;
        Ok(doc)
    }

    pub async fn insert_many(&self, ns: &MongoNamespace, docs: Vec<Value>) -> SyncResult<Vec<Value>> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(self.insert_one(ns, doc).await?);
        }
        Ok(out)
    }

    pub async fn update_one(&self, ns: &MongoNamespace, id: &Value, mut updated: Value) -> SyncResult<()> {
        sanitize(&mut updated);
        let pre_image = self.local().find_one(ns, id).await?;

        let updated_for_write = updated.clone();
        let id_for_write = id.clone();
        let local = self.local().clone();
        self.undo()
            .guarded(ns, id, pre_image.clone(), || async move {
                local.upsert(ns, &id_for_write, updated_for_write).await
            })
            .await?;

        let event = {
            let namespaces = self.namespaces().read().await;
            let Some(runtime) = namespaces.get(ns) else { return Ok(()) };
            let mut cfg = runtime.config.write().await;
            let key = document_key(id);
            let is_upsert_create = pre_image.is_none();
            let base = pre_image.unwrap_or_else(|| serde_json::json!({"_id": id}));
            let diff = update_description_diff(&base, &updated);

            if diff.is_empty() && !is_upsert_create && !cfg.documents.contains_key(&key) {
                return Ok(());
            }

            let doc_config = cfg
                .documents
                .entry(key)
                .or_insert_with(|| CoreDocumentSynchronizationConfig::new(id.clone()));
            let existing = doc_config.last_uncommitted_change_event.clone();

            let event = match existing.as_ref().map(|e| e.operation) {
                None => {
                    // The document didn't exist locally before this call: this is
                    // an upsert-create, which must surface as an INSERT per the
                    // op table, not an UPDATE against a document that was never
                    // inserted remotely.
                    if is_upsert_create {
                        Some(ChangeEvent::insert(ns.clone(), id.clone(), updated.clone()))
                    } else if diff.is_empty() {
                        None
                    } else {
                        Some(ChangeEvent::update(ns.clone(), id.clone(), updated.clone(), diff))
                    }
                }
                Some(OperationType::Insert) => Some(ChangeEvent::insert(ns.clone(), id.clone(), updated.clone())),
                Some(OperationType::Update) => {
                    let mut merged = existing.unwrap().update_description.unwrap_or_default();
                    for (field, value) in diff.updated_fields {
                        merged.removed_fields.remove(&field);
                        merged.updated_fields.insert(field, value);
                    }
                    for field in diff.removed_fields {
                        merged.updated_fields.remove(&field);
                        merged.removed_fields.insert(field);
                    }
                    if merged.is_empty() {
                        None
                    } else {
                        Some(ChangeEvent::update(ns.clone(), id.clone(), updated.clone(), merged))
                    }
                }
                Some(OperationType::Replace) => Some(ChangeEvent::replace(ns.clone(), id.clone(), updated.clone())),
                Some(OperationType::Delete) => {
                    return Err(SyncError::InternalInvariantViolation(
                        "cannot update a document with a pending delete".into(),
                    ));
                }
            };

            match &event {
                Some(event) => doc_config.set_pending(event.clone()),
                None => doc_config.drop_pending(),
            }
            event
        };

        if let Some(event) = event {
            self.emit_change(event).await;
        }
        Ok(())
    }

    pub async fn update_many(&self, ns: &MongoNamespace, updates: Vec<(Value, Value)>) -> SyncResult<()> {
        for (id, doc) in updates {
            self.update_one(ns, &id, doc).await?;
        }
        Ok(())
    }

    pub async fn delete_one(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()> {
        let pre_image = self.local().find_one(ns, id).await?;

        let id_for_write = id.clone();
        let local = self.local().clone();
        self.undo()
            .guarded(ns, id, pre_image, || async move { local.delete(ns, &id_for_write).await })
            .await?;

        let event = {
            let namespaces = self.namespaces().read().await;
            let Some(runtime) = namespaces.get(ns) else { return Ok(()) };
            let mut cfg = runtime.config.write().await;
            let key = document_key(id);

            let existing_op = cfg
                .documents
                .get(&key)
                .and_then(|d| d.last_uncommitted_change_event.as_ref().map(|e| e.operation));

            if existing_op == Some(OperationType::Insert) {
                // Insert-then-delete before either synced: no-op, desync outright.
                cfg.documents.remove(&key);
                return Ok(());
            }

            let event = ChangeEvent::delete(ns.clone(), id.clone());
            let doc_config = cfg
                .documents
                .entry(key)
                .or_insert_with(|| CoreDocumentSynchronizationConfig::new(id.clone()));
            doc_config.set_pending(event.clone());
            event
        };

        self.emit_change(event).await;
        Ok(())
    }

    pub async fn delete_many(&self, ns: &MongoNamespace, ids: &[Value]) -> SyncResult<()> {
        for id in ids {
            self.delete_one(ns, id).await?;
        }
        Ok(())
    }
}
