use crate::namespace::MongoNamespace;
use crate::traits::LocalStore;
use crate::SyncResult;
use serde_json::Value;
use std::sync::Arc;

/// Brackets a local mutation with an undo pre-image per Invariant 3: every
/// mutation of a user document is preceded by inserting the prior image into
/// the undo collection and followed by deleting that row on success.
///
/// Journal rows are written through the same [`LocalStore`] used for user
/// documents rather than a second bespoke storage abstraction.
pub struct UndoJournal {
    store: Arc<dyn LocalStore>,
}

impl UndoJournal {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        UndoJournal { store }
    }

    /// Runs `mutate` bracketed by an undo pre-image write/delete. `pre_image`
    /// is `None` when the document does not yet exist locally (a pure
    /// insert); in that case the recovery pass's step 4 (delete orphans) is
    /// the safety net instead of an undo row.
    pub async fn guarded<F, Fut, T>(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        pre_image: Option<Value>,
        mutate: F,
    ) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = SyncResult<T>>,
    {
        if let Some(pre_image) = pre_image.clone() {
            self.store.insert_undo(ns, id, pre_image).await?;
        }

        let result = mutate().await;

        if pre_image.is_some() {
            // Only clear the journal row once the mutation has actually
            // succeeded; a crash between here and the caller observing the
            // error leaves the pre-image in place for recovery to replay.
            if result.is_ok() {
                self.store.delete_undo(ns, id).await?;
            }
        }

        result
    }

    pub async fn all(&self, ns: &MongoNamespace) -> SyncResult<Vec<(Value, Value)>> {
        self.store.all_undo(ns).await
    }

    pub async fn clear(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()> {
        self.store.delete_undo(ns, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::InMemoryLocalStore;
    use serde_json::json;

    #[tokio::test]
    async fn successful_mutation_clears_undo_row() {
        let store = Arc::new(InMemoryLocalStore::new());
        let journal = UndoJournal::new(store.clone());
        let ns = MongoNamespace::new("t", "c");
        let id = json!(1);

        journal
            .guarded(&ns, &id, Some(json!({"_id": 1, "x": "old"})), || async {
                store.upsert(&ns, &id, json!({"_id": 1, "x": "new"})).await
            })
            .await
            .unwrap();

        assert!(journal.all(&ns).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_mutation_leaves_pre_image_for_recovery() {
        let store = Arc::new(InMemoryLocalStore::new());
        let journal = UndoJournal::new(store.clone());
        let ns = MongoNamespace::new("t", "c");
        let id = json!(1);

        let result: SyncResult<()> = journal
            .guarded(&ns, &id, Some(json!({"_id": 1, "x": "old"})), || async {
                Err(crate::SyncError::NetworkDown)
            })
            .await;

        assert!(result.is_err());
        let undo = journal.all(&ns).await.unwrap();
        assert_eq!(undo.len(), 1);
        assert_eq!(undo[0].1, json!({"_id": 1, "x": "old"}));
    }
}
