//! Concrete collaborators for `stitch-sync-core`: a SQLite-backed
//! `LocalStore` and a WebSocket-backed `RemoteStore`/`ChangeStream`/
//! `NetworkMonitor`, plus HMAC request signing for `AuthClient`. Wiring these
//! three together against `SyncEngine` is what actually compiles and runs
//! end to end, the way `sync-client` does for `sync-core`.

pub mod auth;
pub mod error;
pub mod protocol;
pub mod sqlite_store;
pub mod websocket_store;

pub use auth::{ApiCredentials, HmacAuthClient};
pub use error::ClientError;
pub use sqlite_store::SqliteLocalStore;
pub use websocket_store::WebSocketRemoteStore;
