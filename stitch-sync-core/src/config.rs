use crate::event::ChangeEvent;
use crate::version::DocumentVersion;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Per-document synchronization metadata. A config exists iff the document
/// is "being synchronized".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreDocumentSynchronizationConfig {
    pub document_id: Value,
    pub last_known_remote_version: Option<DocumentVersion>,
    /// Cleared on commit. At most one is retained per document (coalescence,
    /// see the CRUD surface).
    pub last_uncommitted_change_event: Option<ChangeEvent>,
    /// Logical time of the last conflict resolution; `-1` if none.
    pub last_resolution: i64,
    pub is_stale: bool,
    /// Frozen after an unrecoverable error.
    pub is_paused: bool,
    pub has_uncommitted_writes: bool,
}

impl CoreDocumentSynchronizationConfig {
    pub fn new(document_id: Value) -> Self {
        CoreDocumentSynchronizationConfig {
            document_id,
            last_known_remote_version: None,
            last_uncommitted_change_event: None,
            last_resolution: -1,
            is_stale: true,
            is_paused: false,
            has_uncommitted_writes: false,
        }
    }

    pub fn set_pending(&mut self, event: ChangeEvent) {
        self.last_uncommitted_change_event = Some(event);
        self.has_uncommitted_writes = true;
    }

    pub fn clear_pending(&mut self, acknowledged_version: DocumentVersion) {
        self.last_uncommitted_change_event = None;
        self.has_uncommitted_writes = false;
        self.last_known_remote_version = Some(acknowledged_version);
    }

    /// Drops the pending write without acknowledging any remote version —
    /// used when an update coalesces to an empty diff against an existing
    /// pending write and there is nothing left to push.
    pub fn drop_pending(&mut self) {
        self.last_uncommitted_change_event = None;
        self.has_uncommitted_writes = false;
    }

    pub fn pause(&mut self) {
        self.is_paused = true;
    }

    pub fn resume(&mut self) {
        self.is_paused = false;
    }
}

/// Per-namespace set of document configs plus the namespace-wide staleness
/// flag. The conflict handler, change-event listener, and codec are held by
/// the engine keyed by namespace rather than inline here, so this struct
/// stays cheaply cloneable/serializable for persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceSynchronizationConfig {
    pub documents: HashMap<String, CoreDocumentSynchronizationConfig>,
    pub is_stale: bool,
}

impl NamespaceSynchronizationConfig {
    pub fn synchronized_ids(&self) -> Vec<Value> {
        self.documents.values().map(|c| c.document_id.clone()).collect()
    }
}

/// map namespace → namespace config, persisted via the local store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSynchronizationConfig {
    pub namespaces: HashMap<String, NamespaceSynchronizationConfig>,
}

/// Stable string key for a document id, used as the `HashMap` key since
/// `serde_json::Value` is not `Hash`.
pub fn document_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_config_has_no_pending_writes_and_is_stale() {
        let cfg = CoreDocumentSynchronizationConfig::new(json!(1));
        assert!(!cfg.has_uncommitted_writes);
        assert!(cfg.is_stale);
        assert_eq!(cfg.last_resolution, -1);
    }

    #[test]
    fn clear_pending_records_acknowledged_version() {
        let mut cfg = CoreDocumentSynchronizationConfig::new(json!(1));
        let event = ChangeEvent::insert(
            crate::namespace::MongoNamespace::new("t", "c"),
            json!(1),
            json!({"_id": 1}),
        );
        cfg.set_pending(event);
        assert!(cfg.has_uncommitted_writes);

        let version = DocumentVersion::fresh();
        cfg.clear_pending(version.clone());
        assert!(!cfg.has_uncommitted_writes);
        assert!(cfg.last_uncommitted_change_event.is_none());
        assert_eq!(cfg.last_known_remote_version, Some(version));
    }
}
