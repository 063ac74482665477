//! Re-exports the engine and its concrete SQLite/WebSocket collaborators
//! under one crate, so a consumer depends on `stitch-sync` rather than
//! wiring `stitch-sync-core` and `stitch-sync-client` together itself.

pub use stitch_sync_core::*;

pub use stitch_sync_client::{ApiCredentials, ClientError, HmacAuthClient, SqliteLocalStore, WebSocketRemoteStore};
