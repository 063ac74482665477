//! Wires a SQLite local store and a WebSocket remote store into a running
//! `SyncEngine` for one namespace and leaves it running until interrupted.
//!
//! Usage:
//!   DATABASE_URL=sqlite://./local.sqlite3?mode=rwc \
//!   SERVER_URL=wss://example.invalid/ws \
//!   STITCH_EMAIL=demo@example.com \
//!   STITCH_API_KEY=stch_... STITCH_API_SECRET=stcs_... \
//!   cargo run --example run_sync -- mydb mycollection

use std::env;
use std::sync::Arc;
use stitch_sync_client::{ApiCredentials, HmacAuthClient, SqliteLocalStore, WebSocketRemoteStore};
use stitch_sync_core::{EngineConfig, JsonCodec, MongoNamespace, RemoteWins, SyncEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info,stitch_sync_core=debug".to_string()))
        .init();

    let args: Vec<String> = env::args().collect();
    let database = args.get(1).cloned().unwrap_or_else(|| "app".to_string());
    let collection = args.get(2).cloned().unwrap_or_else(|| "documents".to_string());

    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());
    let server_url = env::var("SERVER_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string());
    let email = env::var("STITCH_EMAIL").unwrap_or_else(|_| "demo@example.com".to_string());

    let credentials = match (env::var("STITCH_API_KEY"), env::var("STITCH_API_SECRET")) {
        (Ok(api_key), Ok(secret)) => ApiCredentials { api_key, secret },
        _ => {
            tracing::warn!("no STITCH_API_KEY/STITCH_API_SECRET set, minting throwaway credentials");
            ApiCredentials::generate()
        }
    };
    let auth = Arc::new(HmacAuthClient::new(email, credentials));

    let local = Arc::new(SqliteLocalStore::connect(&database_url).await?);
    let remote = WebSocketRemoteStore::connect_with_retry(&server_url, &auth).await?;

    let engine = Arc::new(SyncEngine::<serde_json::Value>::new(
        local,
        remote.clone(),
        auth,
        remote.clone(),
        EngineConfig::default(),
    ));
    engine.recover().await?;

    let ns = MongoNamespace::new(database, collection);
    engine.sync(ns, vec![], Arc::new(RemoteWins), Arc::new(JsonCodec)).await?;

    let runner = stitch_sync_core::PeriodicRunner::new();
    runner.start(&engine, remote);

    tracing::info!("sync engine running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    runner.stop();
    Ok(())
}
