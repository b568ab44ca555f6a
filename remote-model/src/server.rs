//! WebSocket model server with path-based model routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── "/people" ── records ── BroadcastGroup
//!             ├── request path ──────┤
//! Client B ──┘                      └── "/tasks"  ── records ── BroadcastGroup
//! ```
//!
//! Each served model keeps its records keyed and insertion ordered. A client
//! gets the full snapshot on connect. Its `changeData` / `remove` / `insert`
//! requests are applied to the records and the resulting patch is broadcast
//! to every connection on that path, the requester included.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{record_key, try_record_key, Items, KeyedItems, PatchMessage, ProtocolError};
use crate::reconciler::DEFAULT_KEY_FIELD;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per model
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_messages: u64,
}

/// One collection served at a path.
pub struct ServedModel {
    key_field: String,
    records: RwLock<KeyedItems>,
    broadcast: BroadcastGroup,
}

impl ServedModel {
    /// Build a model from records that each carry `key_field`.
    pub fn new(
        key_field: impl Into<String>,
        records: Vec<Value>,
        broadcast_capacity: usize,
    ) -> Result<Self, ProtocolError> {
        let key_field = key_field.into();
        let mut keyed = KeyedItems::new();
        for record in records {
            keyed.insert(record_key(&record, &key_field)?, record);
        }
        Ok(Self {
            key_field,
            records: RwLock::new(keyed),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        })
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Records in key insertion order.
    pub async fn records(&self) -> Vec<Value> {
        self.records.read().await.values().cloned().collect()
    }

    /// Full snapshot message. `rowData` names the key field when it is not
    /// the default.
    pub async fn snapshot_message(&self) -> PatchMessage {
        let records = self.records.read().await;
        self.full_message(&records)
    }

    /// Full snapshot for a receiver that fell behind. `rx` skips every patch
    /// already contained in the snapshot.
    pub async fn resync(&self, rx: &mut broadcast::Receiver<Arc<String>>) -> PatchMessage {
        // Patches are broadcast under the write lock, so none can slip in here.
        let records = self.records.read().await;
        *rx = rx.resubscribe();
        self.full_message(&records)
    }

    fn full_message(&self, records: &KeyedItems) -> PatchMessage {
        let items = Items::Keyed(records.clone());
        if self.key_field == DEFAULT_KEY_FIELD {
            PatchMessage::Data { items }
        } else {
            PatchMessage::RowData {
                items,
                key: self.key_field.clone(),
            }
        }
    }

    /// Apply a client request and broadcast the resulting patch.
    ///
    /// Returns the broadcast patch, `None` when nothing changed.
    pub async fn handle(&self, msg: PatchMessage) -> Result<Option<PatchMessage>, ProtocolError> {
        // Held across broadcast so patches go out in apply order.
        let mut records = self.records.write().await;

        let patch = match msg {
            PatchMessage::ChangeData { items } => {
                let mut changed = KeyedItems::new();
                for (key, record) in items {
                    if let Some(slot) = records.get_mut(&key) {
                        *slot = record.clone();
                        changed.insert(key, record);
                    }
                }
                (!changed.is_empty()).then_some(PatchMessage::DataChanged { items: changed })
            }
            PatchMessage::Remove { items } => {
                let removed: Vec<String> = items
                    .into_iter()
                    .filter(|key| records.shift_remove(key).is_some())
                    .collect();
                (!removed.is_empty()).then_some(PatchMessage::Removed { items: removed })
            }
            PatchMessage::Insert { items } => {
                let inserted = self.assign_keys(items)?;
                for (key, record) in &inserted {
                    records.insert(key.clone(), record.clone());
                }
                (!inserted.is_empty()).then_some(PatchMessage::Inserted { items: inserted })
            }
            other => return Err(ProtocolError::UnexpectedOperation(other.operation())),
        };

        if let Some(patch) = &patch {
            self.broadcast.broadcast(Arc::new(patch.encode()?));
        }
        Ok(patch)
    }

    /// Key every inserted record, generating a UUID for records without one.
    fn assign_keys(&self, items: Items) -> Result<KeyedItems, ProtocolError> {
        match items {
            Items::Keyed(map) => Ok(map),
            Items::Ordered(list) => {
                let mut keyed = KeyedItems::new();
                for mut record in list {
                    let key = match try_record_key(&record, &self.key_field)? {
                        Some(key) => key,
                        None => {
                            // Only an object can carry its generated key
                            let Some(fields) = record.as_object_mut() else {
                                return Err(ProtocolError::InvalidKey(record.to_string()));
                            };
                            let key = Uuid::new_v4().to_string();
                            fields.insert(self.key_field.clone(), Value::String(key.clone()));
                            key
                        }
                    };
                    keyed.insert(key, record);
                }
                Ok(keyed)
            }
        }
    }
}

/// The model server.
pub struct ModelServer {
    config: ServerConfig,
    /// Request path → served model
    models: HashMap<String, Arc<ServedModel>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl ModelServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            models: HashMap::new(),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Serve `records` at `path`, replacing any model already there.
    ///
    /// Models must be registered before [`ModelServer::run`].
    pub fn add_model(
        &mut self,
        path: impl Into<String>,
        key_field: impl Into<String>,
        records: Vec<Value>,
    ) -> Result<Arc<ServedModel>, ProtocolError> {
        let model = Arc::new(ServedModel::new(
            key_field,
            records,
            self.config.broadcast_capacity,
        )?);
        let path = path.into();
        if self.models.insert(path.clone(), model.clone()).is_some() {
            log::warn!("Replacing model served at {path}");
        }
        Ok(model)
    }

    pub fn model(&self, path: &str) -> Option<Arc<ServedModel>> {
        self.models.get(path).cloned()
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<RwLock<ServerStats>> {
        self.stats.clone()
    }

    /// Bind and serve until the listener fails.
    pub async fn run(self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Model server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), BoxError> {
        let models = Arc::new(self.models);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let models = models.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, models, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    models: Arc<HashMap<String, Arc<ServedModel>>>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), BoxError> {
    let mut path = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };
    let mut ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let model = match models.get(&path) {
        Some(model) => model.clone(),
        None => {
            log::warn!("Request to unknown path {path} from {addr}");
            ws_stream.close(None).await?;
            return Ok(());
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("{addr} subscribed to {path}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Join and snapshot under one read lock so no patch falls in between.
    let connection_id = Uuid::new_v4();
    let (mut broadcast_rx, snapshot) = {
        let records = model.records.read().await;
        let rx = model.broadcast.join(connection_id, addr).await;
        (rx, model.full_message(&records))
    };

    let result = async {
        ws_sender.send(Message::Text(snapshot.encode()?.into())).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_request(&model, text.as_str(), &stats, addr).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(BoxError::from(e)),
                },
                patch = broadcast_rx.recv() => match patch {
                    Ok(encoded) => {
                        ws_sender.send(Message::Text(encoded.to_string().into())).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Too far behind to patch; resend everything.
                        log::warn!("{addr} lagged by {skipped} patches, resyncing");
                        let full = model.resync(&mut broadcast_rx).await;
                        ws_sender.send(Message::Text(full.encode()?.into())).await?;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    model.broadcast.leave(&connection_id).await;
    stats.write().await.active_connections -= 1;
    log::info!("{addr} disconnected from {path}");
    result
}

async fn handle_request(
    model: &ServedModel,
    text: &str,
    stats: &RwLock<ServerStats>,
    addr: SocketAddr,
) {
    let outcome = match PatchMessage::decode(text) {
        Ok(msg) => model.handle(msg).await,
        Err(e) => Err(e),
    };

    let mut s = stats.write().await;
    s.total_messages += 1;
    match outcome {
        Ok(Some(patch)) => log::debug!("{addr}: applied '{}'", patch.operation()),
        Ok(None) => log::debug!("{addr}: request changed nothing"),
        Err(e) => {
            s.rejected_messages += 1;
            log::warn!("{addr}: rejected request: {e}");
        }
    }
}
