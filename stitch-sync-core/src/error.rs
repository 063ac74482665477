use thiserror::Error;

/// Errors surfaced by the synchronization engine and its collaborators.
///
/// New variants may be added without a semver break; match arms must include
/// a wildcard.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("network is unreachable")]
    NetworkDown,

    #[error("authentication session has expired")]
    LoggedOut,

    #[error("operation was interrupted")]
    Interrupted,

    #[error("remote service error {code}: {message}")]
    RemoteServiceError { code: String, message: String },

    #[error("could not parse remote document version: {0}")]
    VersionParseError(String),

    #[error("unknown change event operation type: {0}")]
    UnknownOperationType(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("failed to decode document: {0}")]
    DecodeError(String),

    #[error("could not persist auth info: {0}")]
    CouldNotPersistAuthInfo(String),

    #[error("duplicate key for document {0}")]
    DuplicateKey(String),

    #[error("local store error: {0}")]
    LocalStoreError(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// The remote service reports duplicate-key violations as a generic error
/// code; this is the only place that string is interpreted.
pub fn is_duplicate_key_error(code: &str, message: &str) -> bool {
    code == "MONGODB_ERROR" && message.contains("E11000")
}

impl SyncError {
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if is_duplicate_key_error(&code, &message) {
            SyncError::DuplicateKey(message)
        } else {
            SyncError::RemoteServiceError { code, message }
        }
    }
}
