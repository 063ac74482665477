//! `RemoteStore` + `ChangeStream` backed by a single multiplexed WebSocket
//! connection: request/response calls are correlated by a `request_id` and
//! awaited on a one-shot channel, change events are fanned out to whichever
//! `ChangeStream` is open for their namespace. Mirrors the reader-task /
//! mpsc-dispatch shape of the teacher's `WebSocketClient::start_reading` and
//! `SyncEngine`'s server-message handler, collapsed onto one socket instead
//! of a separate receiver channel wired up by the caller.

use crate::auth::HmacAuthClient;
use crate::error::ClientError;
use crate::protocol::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stitch_sync_core::traits::{ChangeStream, NetworkMonitor, RemoteStore};
use stitch_sync_core::{ChangeEvent, DocumentVersion, MongoNamespace, SyncError, SyncResult};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> SyncError {
    SyncError::from(ClientError::WebSocket(e.to_string()))
}

fn decode_err(e: serde_json::Error) -> SyncError {
    SyncError::from(ClientError::Serialization(e))
}

pub struct WebSocketRemoteStore {
    sink: Mutex<SplitSink<WsStream, Message>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>,
    change_txs: Mutex<HashMap<MongoNamespace, mpsc::UnboundedSender<ChangeEvent>>>,
    connected: AtomicBool,
    net_tx: watch::Sender<bool>,
}

impl WebSocketRemoteStore {
    pub async fn connect(url: &str, auth: &HmacAuthClient) -> Result<Arc<Self>, ClientError> {
        let (ws_stream, _) = connect_async(url).await.map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (mut sink, stream) = ws_stream.split();

        let timestamp = chrono::Utc::now().timestamp();
        let signature = auth.sign_now(timestamp, "");
        let hello = ClientMessage::Authenticate { api_key: auth.api_key.clone(), timestamp, signature };
        let text = serde_json::to_string(&hello)?;
        sink.send(Message::Text(text)).await.map_err(|e| ClientError::WebSocket(e.to_string()))?;

        let (net_tx, _net_rx) = watch::channel(true);
        let store = Arc::new(WebSocketRemoteStore {
            sink: Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            change_txs: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            net_tx,
        });

        let reader = store.clone();
        tokio::spawn(async move { reader.read_loop(stream).await });

        Ok(store)
    }

    /// Connects with exponential backoff, the way the teacher reaches for
    /// `backoff`/`backon` around its own WebSocket reconnect path.
    pub async fn connect_with_retry(url: &str, auth: &HmacAuthClient) -> Result<Arc<Self>, ClientError> {
        (|| async { Self::connect(url, auth).await })
            .retry(ExponentialBuilder::default())
            .notify(|err: &ClientError, dur| {
                tracing::warn!("remote connect failed ({}), retrying in {:?}", err, dur);
            })
            .await
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(server_msg) => self.dispatch(server_msg).await,
                    Err(e) => tracing::warn!("malformed server message: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("websocket read error: {}", e);
                    break;
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.net_tx.send(false);
    }

    async fn dispatch(&self, msg: ServerMessage) {
        if let ServerMessage::Changed { namespace, event } = &msg {
            let txs = self.change_txs.lock().await;
            if let Some(tx) = txs.get(namespace) {
                let _ = tx.send(event.clone());
            }
            return;
        }

        let request_id = msg.request_id().map(|s| s.to_string());
        if let Some(id) = request_id {
            if let Some(tx) = self.pending.lock().await.remove(&id) {
                let _ = tx.send(msg);
            }
        }
    }

    async fn send(&self, msg: &ClientMessage) -> SyncResult<()> {
        let text = serde_json::to_string(msg).map_err(decode_err)?;
        self.sink.lock().await.send(Message::Text(text)).await.map_err(ws_err)
    }

    async fn call(&self, request_id: String, msg: ClientMessage) -> SyncResult<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        self.send(&msg).await?;
        rx.await.map_err(|_| SyncError::from(ClientError::NoResponse(request_id)))
    }
}

#[async_trait]
impl RemoteStore for WebSocketRemoteStore {
    async fn find(&self, ns: &MongoNamespace, ids: &[Value]) -> SyncResult<Vec<Value>> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::Find { request_id: request_id.clone(), namespace: ns.clone(), ids: ids.to_vec() };
        match self.call(request_id, msg).await? {
            ServerMessage::FindResult { docs, .. } => Ok(docs),
            ServerMessage::Error { error, .. } => Err(SyncError::remote(error.code, error.message)),
            _ => Err(SyncError::from(ClientError::UnexpectedResponse("find".into()))),
        }
    }

    async fn find_one(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<Option<Value>> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::FindOne { request_id: request_id.clone(), namespace: ns.clone(), id: id.clone() };
        match self.call(request_id, msg).await? {
            ServerMessage::FindOneResult { doc, .. } => Ok(doc),
            ServerMessage::Error { error, .. } => Err(SyncError::remote(error.code, error.message)),
            _ => Err(SyncError::from(ClientError::UnexpectedResponse("find_one".into()))),
        }
    }

    async fn insert_one(&self, ns: &MongoNamespace, doc: Value) -> SyncResult<()> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::InsertOne { request_id: request_id.clone(), namespace: ns.clone(), doc };
        match self.call(request_id, msg).await? {
            ServerMessage::InsertResult { error: None, .. } => Ok(()),
            ServerMessage::InsertResult { error: Some(e), .. } => Err(SyncError::remote(e.code, e.message)),
            ServerMessage::Error { error, .. } => Err(SyncError::remote(error.code, error.message)),
            _ => Err(SyncError::from(ClientError::UnexpectedResponse("insert_one".into()))),
        }
    }

    async fn replace_one(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        expected_version: Option<&DocumentVersion>,
        replacement: Value,
    ) -> SyncResult<u64> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::ReplaceOne {
            request_id: request_id.clone(),
            namespace: ns.clone(),
            id: id.clone(),
            expected_version: expected_version.cloned(),
            replacement,
        };
        match self.call(request_id, msg).await? {
            ServerMessage::MatchedResult { matched, .. } => Ok(matched),
            ServerMessage::Error { error, .. } => Err(SyncError::remote(error.code, error.message)),
            _ => Err(SyncError::from(ClientError::UnexpectedResponse("replace_one".into()))),
        }
    }

    async fn update_one(
        &self,
        ns: &MongoNamespace,
        id: &Value,
        expected_version: Option<&DocumentVersion>,
        set: HashMap<String, Value>,
        unset: HashSet<String>,
    ) -> SyncResult<u64> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::UpdateOne {
            request_id: request_id.clone(),
            namespace: ns.clone(),
            id: id.clone(),
            expected_version: expected_version.cloned(),
            set,
            unset,
        };
        match self.call(request_id, msg).await? {
            ServerMessage::MatchedResult { matched, .. } => Ok(matched),
            ServerMessage::Error { error, .. } => Err(SyncError::remote(error.code, error.message)),
            _ => Err(SyncError::from(ClientError::UnexpectedResponse("update_one".into()))),
        }
    }

    async fn delete_one(&self, ns: &MongoNamespace, id: &Value, expected_version: Option<&DocumentVersion>) -> SyncResult<u64> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::DeleteOne {
            request_id: request_id.clone(),
            namespace: ns.clone(),
            id: id.clone(),
            expected_version: expected_version.cloned(),
        };
        match self.call(request_id, msg).await? {
            ServerMessage::DeletedResult { deleted, .. } => Ok(deleted),
            ServerMessage::Error { error, .. } => Err(SyncError::remote(error.code, error.message)),
            _ => Err(SyncError::from(ClientError::UnexpectedResponse("delete_one".into()))),
        }
    }

    async fn open_change_stream(&self, ns: &MongoNamespace, ids: Vec<Value>) -> SyncResult<Box<dyn ChangeStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.change_txs.lock().await.insert(ns.clone(), tx);
        self.send(&ClientMessage::Watch { namespace: ns.clone(), ids }).await?;
        Ok(Box::new(WsChangeStream { rx }))
    }
}

impl NetworkMonitor for WebSocketRemoteStore {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.net_tx.subscribe()
    }
}

struct WsChangeStream {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait]
impl ChangeStream for WsChangeStream {
    async fn next_event(&mut self) -> SyncResult<Option<ChangeEvent>> {
        Ok(self.rx.recv().await)
    }
}
