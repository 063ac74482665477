//! Crash recovery (§4.8): restore undo pre-images, replay any pending
//! insert/update/replace intent, clear the undo rows, then delete local
//! orphans. A pending delete is left alone after its pre-image is restored:
//! the document stays present so the next L2R pass can push the delete
//! remotely rather than this module re-deleting it before that happens. Kept
//! free of the engine's namespace-map locking so it can be driven, and
//! tested, against a bare `LocalStore` + `UndoJournal` pair.

use crate::config::{document_key, CoreDocumentSynchronizationConfig};
use crate::event::OperationType;
use crate::namespace::MongoNamespace;
use crate::traits::LocalStore;
use crate::undo::UndoJournal;
use crate::SyncResult;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Runs the recovery protocol for one namespace. Idempotent and re-entrant:
/// safe to call again if a previous attempt was interrupted partway.
pub async fn recover_namespace(
    local: &Arc<dyn LocalStore>,
    undo: &UndoJournal,
    ns: &MongoNamespace,
    documents: &HashMap<String, CoreDocumentSynchronizationConfig>,
) -> SyncResult<()> {
    let pre_images = undo.all(ns).await?;

    for (id, pre_image) in &pre_images {
        local.upsert(ns, id, pre_image.clone()).await?;
    }

    for (id, _) in &pre_images {
        let Some(doc_config) = documents.get(&document_key(id)) else { continue };
        let Some(event) = &doc_config.last_uncommitted_change_event else { continue };
        match event.operation {
            OperationType::Insert | OperationType::Update | OperationType::Replace => {
                if let Some(doc) = &event.full_document {
                    local.upsert(ns, id, doc.clone()).await?;
                }
            }
            // The pre-image restored above already is the correct local
            // state for a pending delete: the next L2R pass pushes the
            // DELETE remotely from there. Re-deleting here would undo the
            // restore within the same recovery call.
            OperationType::Delete => {}
        }
    }

    for (id, _) in &pre_images {
        undo.clear(ns, id).await?;
    }

    let known_ids: HashSet<String> = documents.keys().cloned().collect();
    for id in local.all_ids(ns).await? {
        if !known_ids.contains(&document_key(&id)) {
            local.delete(ns, &id).await?;
        }
    }

    Ok(())
}
