//! Wire messages exchanged with the remote document service over the
//! WebSocket connection. One connection multiplexes request/response calls
//! (correlated by `request_id`) and a push feed of change events per
//! namespace, the way the teacher's `ClientMessage`/`ServerMessage` pair
//! share a single socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use stitch_sync_core::{ChangeEvent, DocumentVersion, MongoNamespace};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Authenticate { api_key: String, timestamp: i64, signature: String },
    Find { request_id: String, namespace: MongoNamespace, ids: Vec<Value> },
    FindOne { request_id: String, namespace: MongoNamespace, id: Value },
    InsertOne { request_id: String, namespace: MongoNamespace, doc: Value },
    ReplaceOne {
        request_id: String,
        namespace: MongoNamespace,
        id: Value,
        expected_version: Option<DocumentVersion>,
        replacement: Value,
    },
    UpdateOne {
        request_id: String,
        namespace: MongoNamespace,
        id: Value,
        expected_version: Option<DocumentVersion>,
        set: HashMap<String, Value>,
        unset: HashSet<String>,
    },
    DeleteOne {
        request_id: String,
        namespace: MongoNamespace,
        id: Value,
        expected_version: Option<DocumentVersion>,
    },
    Watch { namespace: MongoNamespace, ids: Vec<Value> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Authenticated,
    AuthFailed { message: String },
    FindResult { request_id: String, docs: Vec<Value> },
    FindOneResult { request_id: String, doc: Option<Value> },
    InsertResult { request_id: String, error: Option<WireError> },
    MatchedResult { request_id: String, matched: u64 },
    DeletedResult { request_id: String, deleted: u64 },
    Error { request_id: String, error: WireError },
    Changed { namespace: MongoNamespace, event: ChangeEvent },
}

impl ServerMessage {
    /// The `request_id` a request/response message correlates to, if any.
    /// `Changed` carries none — it's a push, not a reply.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerMessage::FindResult { request_id, .. }
            | ServerMessage::FindOneResult { request_id, .. }
            | ServerMessage::InsertResult { request_id, .. }
            | ServerMessage::MatchedResult { request_id, .. }
            | ServerMessage::DeletedResult { request_id, .. }
            | ServerMessage::Error { request_id, .. } => Some(request_id),
            ServerMessage::Authenticated | ServerMessage::AuthFailed { .. } | ServerMessage::Changed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}
