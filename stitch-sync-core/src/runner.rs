//! Periodic runner (§5): drives `do_sync_pass` on its own task, sleeping
//! 500ms after a successful pass and 5000ms after a failed one, but waking
//! immediately on a network reachability up-edge.

use crate::engine::SyncEngine;
use crate::traits::NetworkMonitor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Holds only a weak reference to the engine, per the cyclic-reference
/// design note: the engine's drop doesn't wait on this task, and the task
/// exits on its own once the engine is gone.
pub struct PeriodicRunner {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicRunner {
    pub fn new() -> Self {
        PeriodicRunner { handle: Mutex::new(None) }
    }

    pub fn start<D>(&self, engine: &Arc<SyncEngine<D>>, network: Arc<dyn NetworkMonitor>)
    where
        D: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.stop();

        let weak = Arc::downgrade(engine);
        let mut net_rx = network.subscribe();
        let success_delay = engine.config().sleep_after_success;
        let failure_delay = engine.config().sleep_after_failure;

        let task = tokio::spawn(async move {
            loop {
                let Some(engine) = weak.upgrade() else {
                    tracing::debug!("engine dropped, periodic runner exiting");
                    break;
                };

                let delay = match engine.do_sync_pass().await {
                    Ok(()) => success_delay,
                    Err(e) => {
                        tracing::warn!("sync pass failed, backing off: {}", e);
                        failure_delay
                    }
                };
                drop(engine);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = net_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Any edge is worth an immediate retry; a down-edge
                        // pass will simply find nothing reachable and sleep.
                    }
                }
            }
        });

        *self.handle.lock().unwrap() = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.handle.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }
}

impl Default for PeriodicRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PeriodicRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::RemoteWins;
    use crate::engine::EngineConfig;
    use crate::namespace::MongoNamespace;
    use crate::testutil::{InMemoryLocalStore, InMemoryRemoteStore};
    use crate::traits::JsonCodec;
    use crate::SyncResult;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    struct Doc {
        #[serde(rename = "_id")]
        id: i64,
    }

    struct AlwaysOnline;
    #[async_trait::async_trait]
    impl crate::traits::AuthClient for AlwaysOnline {
        async fn is_logged_in(&self) -> bool {
            true
        }
        async fn refresh_token(&self) -> SyncResult<()> {
            Ok(())
        }
    }
    impl NetworkMonitor for AlwaysOnline {
        fn is_connected(&self) -> bool {
            true
        }
        fn subscribe(&self) -> tokio::sync::watch::Receiver<bool> {
            tokio::sync::watch::channel(true).1
        }
    }

    #[tokio::test]
    async fn runner_drives_passes_and_stops_cleanly() {
        let local = Arc::new(InMemoryLocalStore::new());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = Arc::new(SyncEngine::new(
            local,
            remote.clone(),
            Arc::new(AlwaysOnline),
            Arc::new(AlwaysOnline),
            EngineConfig {
                sleep_after_success: Duration::from_millis(10),
                sleep_after_failure: Duration::from_millis(10),
                batch_bytes_cap: 5 * 1024 * 1024,
            },
        ));
        let ns = MongoNamespace::new("t", "c");
        engine.sync(ns.clone(), vec![], Arc::new(RemoteWins), Arc::new(JsonCodec)).await.unwrap();
        engine.insert_one(&ns, json!({"_id": 1})).await.unwrap();

        let runner = PeriodicRunner::new();
        runner.start(&engine, Arc::new(AlwaysOnline));
        assert!(runner.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(remote.get(&ns, &json!(1)).is_some());

        runner.stop();
        assert!(!runner.is_running());
    }
}
