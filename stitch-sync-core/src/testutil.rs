//! In-memory fakes for the external collaborators, used by this crate's own
//! tests. Mirrors the teacher's preference for a real in-memory store over a
//! mocking framework: these are small, real implementations of the traits,
//! not call-recording mocks.

use crate::event::ChangeEvent;
use crate::namespace::MongoNamespace;
use crate::traits::{BatchOps, ChangeStream, LocalStore, RemoteStore};
use crate::version::{get_remote_version_info, DocumentVersion};
use crate::{SyncError, SyncResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;

fn key(ns: &MongoNamespace) -> String {
    ns.to_string()
}

fn id_key(id: &Value) -> String {
    crate::config::document_key(id)
}

#[derive(Default)]
pub struct InMemoryLocalStore {
    docs: Mutex<HashMap<String, HashMap<String, Value>>>,
    undo: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ns: &MongoNamespace, id: &Value) -> Option<Value> {
        self.docs
            .lock()
            .unwrap()
            .get(&key(ns))
            .and_then(|m| m.get(&id_key(id)))
            .cloned()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn find(&self, ns: &MongoNamespace, ids: &[Value]) -> SyncResult<Vec<Value>> {
        let docs = self.docs.lock().unwrap();
        let Some(coll) = docs.get(&key(ns)) else {
            return Ok(vec![]);
        };
        Ok(ids.iter().filter_map(|id| coll.get(&id_key(id)).cloned()).collect())
    }

    async fn find_one(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<Option<Value>> {
        Ok(self.docs.lock().unwrap().get(&key(ns)).and_then(|m| m.get(&id_key(id)).cloned()))
    }

    async fn all_ids(&self, ns: &MongoNamespace) -> SyncResult<Vec<Value>> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .get(&key(ns))
            .map(|m| m.values().filter_map(|d| d.get("_id").cloned()).collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, ns: &MongoNamespace, id: &Value, doc: Value) -> SyncResult<()> {
        self.docs
            .lock()
            .unwrap()
            .entry(key(ns))
            .or_default()
            .insert(id_key(id), doc);
        Ok(())
    }

    async fn delete(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()> {
        if let Some(coll) = self.docs.lock().unwrap().get_mut(&key(ns)) {
            coll.remove(&id_key(id));
        }
        Ok(())
    }

    async fn bulk_write(&self, ns: &MongoNamespace, ops: BatchOps) -> SyncResult<()> {
        for (id, doc) in ops.upserts {
            self.upsert(ns, &id, doc).await?;
        }
        for id in ops.deletes {
            self.delete(ns, &id).await?;
        }
        Ok(())
    }

    async fn insert_undo(&self, ns: &MongoNamespace, id: &Value, pre_image: Value) -> SyncResult<()> {
        self.undo
            .lock()
            .unwrap()
            .entry(key(ns))
            .or_default()
            .insert(id_key(id), pre_image);
        Ok(())
    }

    async fn delete_undo(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()> {
        if let Some(coll) = self.undo.lock().unwrap().get_mut(&key(ns)) {
            coll.remove(&id_key(id));
        }
        Ok(())
    }

    async fn all_undo(&self, ns: &MongoNamespace) -> SyncResult<Vec<(Value, Value)>> {
        Ok(self
            .undo
            .lock()
            .unwrap()
            .get(&key(ns))
            .map(|m| m.values().map(|d| (d.get("_id").cloned().unwrap_or(Value::Null), d.clone())).collect())
            .unwrap_or_default())
    }
}

struct FakeChangeStream {
    rx: Mutex<mpsc::UnboundedReceiver<ChangeEvent>>,
}

#[async_trait]
impl ChangeStream for FakeChangeStream {
    async fn next_event(&mut self) -> SyncResult<Option<ChangeEvent>> {
        Ok(self.rx.get_mut().unwrap().recv().await)
    }
}

/// A remote store whose documents, version enforcement, and change-stream
/// feed are all driven explicitly by the test.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    docs: Mutex<HashMap<String, HashMap<String, Value>>>,
    stream_tx: Mutex<HashMap<String, mpsc::UnboundedSender<ChangeEvent>>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, ns: &MongoNamespace, doc: Value) {
        let id = doc.get("_id").cloned().expect("seeded doc needs _id");
        self.docs
            .lock()
            .unwrap()
            .entry(key(ns))
            .or_default()
            .insert(id_key(&id), doc);
    }

    pub fn get(&self, ns: &MongoNamespace, id: &Value) -> Option<Value> {
        self.docs.lock().unwrap().get(&key(ns)).and_then(|m| m.get(&id_key(id)).cloned())
    }

    /// Pushes an event directly onto the open change stream for `ns`, if one
    /// has been opened. Silently dropped otherwise (mirrors a real driver:
    /// nothing is listening).
    pub fn push_event(&self, ns: &MongoNamespace, event: ChangeEvent) {
        if let Some(tx) = self.stream_tx.lock().unwrap().get(&key(ns)) {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn find(&self, ns: &MongoNamespace, ids: &[Value]) -> SyncResult<Vec<Value>> {
        let docs = self.docs.lock().unwrap();
        let Some(coll) = docs.get(&key(ns)) else {
            return Ok(vec![]);
        };
        Ok(ids.iter().filter_map(|id| coll.get(&id_key(id)).cloned()).collect())
    }

    async fn find_one(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<Option<Value>> {
        Ok(self.get(ns, id))
    }

    async fn insert_one(&self, ns: &MongoNamespace, doc: Value) -> SyncResult<()> {
        let id = doc.get("_id").cloned().ok_or_else(|| {
            SyncError::InternalInvariantViolation("document missing _id".into())
        })?;
        let mut docs = self.docs.lock().unwrap();
        let coll = docs.entry(key(ns)).or_default();
        if coll.contains_key(&id_key(&id)) {
            return Err(SyncError::remote("MONGODB_ERROR", "E11000 duplicate key error"));
        }
        coll.insert(id_key(&id), doc);
        Ok(())
    }

    async fn replace_one(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        expected_version: Option<&DocumentVersion>,
        replacement: Value,
    ) -> SyncResult<u64> {
        let mut docs = self.docs.lock().unwrap();
        let coll = docs.entry(key(ns)).or_default();
        let matches = match coll.get(&id_key(id)) {
            Some(existing) => get_remote_version_info(existing).ok().flatten() == expected_version.cloned(),
            None => false,
        };
        if matches {
            coll.insert(id_key(id), replacement);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn update_one(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        expected_version: Option<&DocumentVersion>,
        set: HashMap<String, Value>,
        unset: HashSet<String>,
    ) -> SyncResult<u64> {
        let mut docs = self.docs.lock().unwrap();
        let coll = docs.entry(key(ns)).or_default();
        let Some(existing) = coll.get_mut(&id_key(id)) else {
            return Ok(0);
        };
        if get_remote_version_info(existing).ok().flatten() != expected_version.cloned() {
            return Ok(0);
        }
        if let Value::Object(map) = existing {
            for (k, v) in set {
                map.insert(k, v);
            }
            for k in unset {
                map.remove(&k);
            }
        }
        Ok(1)
    }

    async fn delete_one(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        expected_version: Option<&DocumentVersion>,
    ) -> SyncResult<u64> {
        let mut docs = self.docs.lock().unwrap();
        let coll = docs.entry(key(ns)).or_default();
        let matches = match coll.get(&id_key(id)) {
            Some(existing) => get_remote_version_info(existing).ok().flatten() == expected_version.cloned(),
            None => false,
        };
        if matches {
            coll.remove(&id_key(id));
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn open_change_stream(
        &self,
        ns: &MongoNamespace,
        _ids: Vec<Value>,
    ) -> SyncResult<Box<dyn ChangeStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stream_tx.lock().unwrap().insert(key(ns), tx);
        Ok(Box::new(FakeChangeStream { rx: Mutex::new(rx) }))
    }
}
