//! External collaborators, referenced only by the interfaces they present.
//! Concrete implementations (a real embedded store, a real WebSocket-backed
//! remote service) live in `stitch-sync-client`.

use crate::event::ChangeEvent;
use crate::namespace::MongoNamespace;
use crate::version::DocumentVersion;
use crate::SyncResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A batch of local-store writes accumulated by the R2L pass before being
/// committed together. Capped at roughly 5 MiB (see `EngineConfig`).
#[derive(Debug, Clone, Default)]
pub struct BatchOps {
    pub upserts: Vec<(Value, Value)>,
    pub deletes: Vec<Value>,
    approx_bytes: usize,
}

impl BatchOps {
    pub fn push_upsert(&mut self, id: Value, doc: Value) {
        self.approx_bytes += estimate_size(&doc);
        self.upserts.push((id, doc));
    }

    pub fn push_delete(&mut self, id: Value) {
        self.approx_bytes += estimate_size(&id);
        self.deletes.push(id);
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

fn estimate_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Local embedded document store. Bulk writes may be non-atomic across
/// documents but MUST be atomic per document.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn find(&self, ns: &MongoNamespace, ids: &[Value]) -> SyncResult<Vec<Value>>;
    async fn find_one(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<Option<Value>>;
    async fn all_ids(&self, ns: &MongoNamespace) -> SyncResult<Vec<Value>>;
    async fn upsert(&self, ns: &MongoNamespace, id: &Value, doc: Value) -> SyncResult<()>;
    async fn delete(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()>;
    async fn bulk_write(&self, ns: &MongoNamespace, ops: BatchOps) -> SyncResult<()>;

    async fn insert_undo(&self, ns: &MongoNamespace, id: &Value, pre_image: Value) -> SyncResult<()>;
    async fn delete_undo(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()>;
    /// All currently-journaled pre-images, as `(id, pre_image)` pairs.
    async fn all_undo(&self, ns: &MongoNamespace) -> SyncResult<Vec<(Value, Value)>>;
}

/// An open, per-namespace remote change stream.
#[async_trait]
pub trait ChangeStream: Send {
    /// Blocks until the next event is available. `Ok(None)` signals the
    /// stream closed cleanly (e.g. on `stop()`); `Err` signals stream I/O
    /// failure, which the listener treats as a close-and-retry.
    async fn next_event(&mut self) -> SyncResult<Option<ChangeEvent>>;
}

/// Remote document service: find/insert/update/delete a collection, open a
/// change stream filtered by id set.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn find(&self, ns: &MongoNamespace, ids: &[Value]) -> SyncResult<Vec<Value>>;
    async fn find_one(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<Option<Value>>;

    async fn insert_one(&self, ns: &MongoNamespace, doc: Value) -> SyncResult<()>;

    /// Returns the matched count.
    async fn replace_one(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        expected_version: Option<&DocumentVersion>,
        replacement: Value,
    ) -> SyncResult<u64>;

    /// Returns the matched count.
    async fn update_one(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        expected_version: Option<&DocumentVersion>,
        set: HashMap<String, Value>,
        unset: HashSet<String>,
    ) -> SyncResult<u64>;

    /// Returns the deleted count.
    async fn delete_one(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        expected_version: Option<&DocumentVersion>,
    ) -> SyncResult<u64>;

    async fn open_change_stream(
        &self,
        ns: &MongoNamespace,
        ids: Vec<Value>,
    ) -> SyncResult<Box<dyn ChangeStream>>;
}

/// Capability: is-logged-in, refresh-token, authenticated request. The
/// authenticated-request capability is exercised implicitly by `RemoteStore`
/// implementations; this trait exposes only the state the engine itself must
/// branch on.
#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn is_logged_in(&self) -> bool;
    async fn refresh_token(&self) -> SyncResult<()>;
}

/// Network reachability monitor. `subscribe` yields edges (false→true is an
/// "up-edge") the periodic runner and stream listeners react to.
pub trait NetworkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
    fn subscribe(&self) -> tokio::sync::watch::Receiver<bool>;
}

/// Encodes/decodes between the user's document type and the wire/storage
/// representation. Used at the edges only: the CRUD surface and the conflict
/// resolver. Internally the engine operates on sanitized JSON.
pub trait DocumentCodec<D>: Send + Sync {
    fn encode(&self, doc: &D) -> SyncResult<Value>;
    fn decode(&self, value: &Value) -> SyncResult<D>;
}

/// A codec for document types that already speak `serde_json::Value`
/// natively via `Serialize`/`Deserialize`.
pub struct JsonCodec;

impl<D> DocumentCodec<D> for JsonCodec
where
    D: serde::Serialize + serde::de::DeserializeOwned,
{
    fn encode(&self, doc: &D) -> SyncResult<Value> {
        serde_json::to_value(doc).map_err(|e| crate::error::SyncError::DecodeError(e.to_string()))
    }

    fn decode(&self, value: &Value) -> SyncResult<D> {
        serde_json::from_value(value.clone())
            .map_err(|e| crate::error::SyncError::DecodeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_ops_tracks_approx_size() {
        let mut batch = BatchOps::default();
        assert!(batch.is_empty());
        batch.push_upsert(json!(1), json!({"_id": 1, "x": "a"}));
        assert!(!batch.is_empty());
        assert!(batch.approx_bytes() > 0);
    }

    #[test]
    fn json_codec_roundtrips() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Doc {
            x: i32,
        }
        let codec = JsonCodec;
        let encoded = codec.encode(&Doc { x: 1 }).unwrap();
        let decoded: Doc = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, Doc { x: 1 });
    }
}
