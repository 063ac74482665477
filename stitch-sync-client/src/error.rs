//! Transport/storage errors specific to this crate's concrete collaborators.
//! Translated to `stitch_sync_core::SyncError` at the trait-impl boundary so
//! the engine never has to know it's talking to SQLite or a WebSocket.

use stitch_sync_core::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request {0} was never answered (connection closed)")]
    NoResponse(String),

    #[error("unexpected response to request {0}")]
    UnexpectedResponse(String),
}

impl From<ClientError> for SyncError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Database(e) => SyncError::LocalStoreError(e.to_string()),
            ClientError::Serialization(e) => SyncError::DecodeError(e.to_string()),
            other => SyncError::RemoteServiceError {
                code: "TRANSPORT_ERROR".to_string(),
                message: other.to_string(),
            },
        }
    }
}
