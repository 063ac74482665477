//! Conflict resolution: the single point at which two divergent edits to the
//! same document are reduced to one outcome. Everything downstream (local
//! store, remote store, undo journal) just applies whatever comes out of
//! here.

use crate::event::ChangeEvent;
use crate::SyncResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// What a resolver decided should become of a conflicted document.
/// `Delete` is the resolver's equivalent of returning a null document.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution<D> {
    Delete,
    Replace(D),
}

/// User-supplied conflict policy for one namespace. Given the conflicting
/// local and remote events for a document, decides what the document should
/// become. A resolver that returns `Err` pauses the document rather than
/// retrying — a thrown resolver is treated as a permanent failure, not a
/// transient one.
#[async_trait]
pub trait ConflictHandler<D>: Send + Sync {
    async fn resolve(
        &self,
        document_id: &Value,
        local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> SyncResult<ConflictResolution<D>>;
}

fn decode<D: DeserializeOwned>(doc: &Value) -> SyncResult<D> {
    serde_json::from_value(doc.clone()).map_err(|e| crate::error::SyncError::DecodeError(e.to_string()))
}

/// Built-in strategy: the local write always wins. Deletes the document if
/// the local event itself was a delete.
pub struct LocalWins;

#[async_trait]
impl<D> ConflictHandler<D> for LocalWins
where
    D: DeserializeOwned + Send + Sync,
{
    async fn resolve(
        &self,
        _document_id: &Value,
        local_event: &ChangeEvent,
        _remote_event: &ChangeEvent,
    ) -> SyncResult<ConflictResolution<D>> {
        match &local_event.full_document {
            Some(doc) => Ok(ConflictResolution::Replace(decode(doc)?)),
            None => Ok(ConflictResolution::Delete),
        }
    }
}

/// Built-in strategy: the remote write always wins.
pub struct RemoteWins;

#[async_trait]
impl<D> ConflictHandler<D> for RemoteWins
where
    D: DeserializeOwned + Send + Sync,
{
    async fn resolve(
        &self,
        _document_id: &Value,
        _local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> SyncResult<ConflictResolution<D>> {
        match &remote_event.full_document {
            Some(doc) => Ok(ConflictResolution::Replace(decode(doc)?)),
            None => Ok(ConflictResolution::Delete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::MongoNamespace;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Doc {
        x: i32,
    }

    fn event(ns: &MongoNamespace, body: Option<Value>) -> ChangeEvent {
        match body {
            Some(doc) => ChangeEvent::replace(ns.clone(), doc["_id"].clone(), doc),
            None => ChangeEvent::delete(ns.clone(), json!(1)),
        }
    }

    #[tokio::test]
    async fn local_wins_takes_local_document() {
        let ns = MongoNamespace::new("t", "c");
        let local = event(&ns, Some(json!({"_id": 1, "x": 1})));
        let remote = event(&ns, Some(json!({"_id": 1, "x": 2})));
        let resolution: ConflictResolution<Doc> =
            LocalWins.resolve(&json!(1), &local, &remote).await.unwrap();
        assert_eq!(resolution, ConflictResolution::Replace(Doc { x: 1 }));
    }

    #[tokio::test]
    async fn remote_wins_deletes_when_remote_event_is_a_delete() {
        let ns = MongoNamespace::new("t", "c");
        let local = event(&ns, Some(json!({"_id": 1, "x": 1})));
        let remote = event(&ns, None);
        let resolution: ConflictResolution<Doc> =
            RemoteWins.resolve(&json!(1), &local, &remote).await.unwrap();
        assert_eq!(resolution, ConflictResolution::Delete);
    }
}
