//! Bidirectional document synchronization core: keeps a local embedded
//! document store consistent with a remote document service, offline-first,
//! with at-most-once application of remote changes, write/write conflict
//! detection and resolution, and crash-safe recovery.
//!
//! The engine ([`engine::SyncEngine`]) is generic over a user document type
//! `D`; internally it moves sanitized `serde_json::Value`, decoding to `D`
//! only at the conflict-resolver boundary via a [`traits::DocumentCodec`].

pub mod clock;
pub mod config;
pub mod conflict;
pub mod crud;
pub mod engine;
pub mod error;
pub mod event;
pub mod listener;
pub mod namespace;
pub mod pool;
pub mod recovery;
pub mod runner;
pub mod traits;
pub mod undo;
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{SyncError, SyncResult};

pub use config::{CoreDocumentSynchronizationConfig, InstanceSynchronizationConfig, NamespaceSynchronizationConfig};
pub use conflict::{ConflictHandler, ConflictResolution, LocalWins, RemoteWins};
pub use engine::{EngineConfig, EngineError, SyncEngine};
pub use event::{ChangeEvent, OperationType};
pub use namespace::MongoNamespace;
pub use runner::PeriodicRunner;
pub use traits::{AuthClient, BatchOps, ChangeStream, DocumentCodec, JsonCodec, LocalStore, NetworkMonitor, RemoteStore};
pub use version::{DocumentVersion, UpdateDescription, VERSION_FIELD};
