use crate::namespace::MongoNamespace;
use crate::version::UpdateDescription;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

/// The four operations a change event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

/// A single change, either observed on the remote change stream or
/// synthesized locally (CRUD surface, R2L catch-up).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: OperationType,
    pub namespace: MongoNamespace,
    /// The primary-id singleton this event concerns.
    pub document_key: Value,
    /// `None` for DELETE.
    pub full_document: Option<Value>,
    /// `Some` only for UPDATE.
    pub update_description: Option<UpdateDescription>,
    pub uncommitted_writes: bool,
    /// Opaque identifier, unique per event, used for dedup/logging.
    pub id: String,
}

impl ChangeEvent {
    pub fn insert(namespace: MongoNamespace, document_key: Value, full_document: Value) -> Self {
        ChangeEvent {
            operation: OperationType::Insert,
            namespace,
            document_key,
            full_document: Some(full_document),
            update_description: None,
            uncommitted_writes: true,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn update(
        namespace: MongoNamespace,
        document_key: Value,
        full_document: Value,
        update_description: UpdateDescription,
    ) -> Self {
        ChangeEvent {
            operation: OperationType::Update,
            namespace,
            document_key,
            full_document: Some(full_document),
            update_description: Some(update_description),
            uncommitted_writes: true,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn replace(namespace: MongoNamespace, document_key: Value, full_document: Value) -> Self {
        ChangeEvent {
            operation: OperationType::Replace,
            namespace,
            document_key,
            full_document: Some(full_document),
            update_description: None,
            uncommitted_writes: true,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn delete(namespace: MongoNamespace, document_key: Value) -> Self {
        ChangeEvent {
            operation: OperationType::Delete,
            namespace,
            document_key,
            full_document: None,
            update_description: None,
            uncommitted_writes: true,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn committed(mut self) -> Self {
        self.uncommitted_writes = false;
        self
    }
}
