use crate::listener::StreamListener;
use crate::namespace::MongoNamespace;
use crate::traits::{AuthClient, NetworkMonitor, RemoteStore};
use crate::SyncResult;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Owns one [`StreamListener`] per watched namespace. Namespace membership
/// changes (`add`/`remove`) take the pool-wide write lock; starting or
/// stopping an individual listener does not.
#[derive(Default)]
pub struct ListenerPool {
    listeners: RwLock<HashMap<MongoNamespace, Arc<StreamListener>>>,
}

impl ListenerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_namespace(&self, ns: MongoNamespace) -> Arc<StreamListener> {
        let mut guard = self.listeners.write().await;
        guard
            .entry(ns.clone())
            .or_insert_with(|| Arc::new(StreamListener::new(ns)))
            .clone()
    }

    pub async fn remove_namespace(&self, ns: &MongoNamespace) {
        let listener = self.listeners.write().await.remove(ns);
        if let Some(listener) = listener {
            listener.stop().await;
        }
    }

    pub async fn get(&self, ns: &MongoNamespace) -> Option<Arc<StreamListener>> {
        self.listeners.read().await.get(ns).cloned()
    }

    pub async fn namespaces(&self) -> Vec<MongoNamespace> {
        self.listeners.read().await.keys().cloned().collect()
    }

    /// Restarts every listener whose id set is non-empty, e.g. after a
    /// network up-edge or an id-set change. Listeners whose namespace has no
    /// tracked ids are left closed.
    pub async fn start_all(
        &self,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthClient>,
        network: Arc<dyn NetworkMonitor>,
        ids_by_namespace: &HashMap<MongoNamespace, Vec<Value>>,
    ) -> SyncResult<()> {
        let listeners: Vec<_> = self.listeners.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (ns, listener) in listeners {
            let ids = ids_by_namespace.get(&ns).cloned().unwrap_or_default();
            listener.start(remote.clone(), auth.clone(), network.clone(), ids).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let listeners: Vec<_> = self.listeners.read().await.values().cloned().collect();
        for listener in listeners {
            listener.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_is_idempotent_and_remove_stops() {
        let pool = ListenerPool::new();
        let ns = MongoNamespace::new("t", "c");
        let a = pool.add_namespace(ns.clone()).await;
        let b = pool.add_namespace(ns.clone()).await;
        assert!(Arc::ptr_eq(&a, &b));

        pool.remove_namespace(&ns).await;
        assert!(pool.get(&ns).await.is_none());
    }
}
