//! Remote model client.
//!
//! Provides:
//! - Connection over any [`Transport`] (WebSocket by default)
//! - A replay-latest stream of the mirrored records
//! - Edit / insert / remove requests round-tripped through the remote
//!
//! A background driver task owns the transport. It alternates between the
//! outgoing request queue and the next inbound frame, so patches are applied
//! strictly in arrival order.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::broadcast::{Records, ReplaySubject, Subscription};
use crate::protocol::{PatchMessage, ProtocolError};
use crate::reconciler::{Reconciler, SyncError, DEFAULT_KEY_FIELD};
use crate::transport::{Transport, WebSocketTransport};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL; the path selects the served model
    pub url: String,
    /// Key field until the server names one
    pub key_field: String,
    /// Queued outgoing requests before callers wait
    pub outgoing_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9191/".to_string(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            outgoing_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Closed locally or by the remote
    Disconnected,
    /// Stopped on a transport error or a protocol violation
    Failed,
}

enum Command {
    Send(PatchMessage),
    Close,
}

/// How the driver loop ended.
enum DriverExit {
    ClosedLocally,
    ClosedRemotely,
    TransportFailed(ProtocolError),
    Rejected,
}

/// A locally mirrored remote collection.
pub struct RemoteModel {
    reconciler: Arc<RwLock<Reconciler>>,
    subject: ReplaySubject,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Command>,
    driver: Option<JoinHandle<()>>,
}

impl RemoteModel {
    /// Connect to `config.url` over WebSocket.
    pub async fn connect(config: ClientConfig) -> Result<Self, ProtocolError> {
        let transport = WebSocketTransport::connect(&config.url).await?;
        Ok(Self::with_transport(transport, &config))
    }

    /// Drive an already open transport. Must be called inside a tokio runtime.
    pub fn with_transport<T: Transport + 'static>(transport: T, config: &ClientConfig) -> Self {
        let reconciler = Reconciler::new(config.key_field.clone());
        let subject = reconciler.subject().clone();
        let reconciler = Arc::new(RwLock::new(reconciler));
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_capacity.max(1));

        let driver = tokio::spawn(drive(
            transport,
            reconciler.clone(),
            outgoing_rx,
            state.clone(),
        ));

        Self {
            reconciler,
            subject,
            state,
            outgoing_tx,
            driver: Some(driver),
        }
    }

    /// Subscribe to the mirrored records.
    ///
    /// The first event is the latest published snapshot.
    pub async fn items(&self) -> Subscription {
        self.subject.subscribe().await
    }

    /// The most recently published records.
    pub async fn latest(&self) -> Records {
        self.subject.latest().await
    }

    /// Ask the remote to replace the record with the same key.
    pub async fn edit_item(&self, record: Value) -> Result<(), SyncError> {
        let msg = self.reconciler.read().await.edit(record)?;
        self.send(msg).await
    }

    /// Ask the remote to remove the record with `key`.
    pub async fn remove_item(&self, key: impl Into<String>) -> Result<(), SyncError> {
        let msg = self.reconciler.read().await.remove(key)?;
        self.send(msg).await
    }

    /// Ask the remote to insert `record`, assigning a key if it has none.
    pub async fn insert_item(&self, record: Value) -> Result<(), SyncError> {
        let msg = self.reconciler.read().await.insert(record)?;
        self.send(msg).await
    }

    async fn send(&self, msg: PatchMessage) -> Result<(), SyncError> {
        self.outgoing_tx
            .send(Command::Send(msg))
            .await
            .map_err(|_| SyncError::Protocol(ProtocolError::ConnectionClosed))
    }

    /// Current key field.
    pub async fn key_field(&self) -> String {
        self.reconciler.read().await.key_field().to_string()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Close the connection and complete the stream.
    pub async fn close(&mut self) {
        let _ = self.outgoing_tx.send(Command::Close).await;
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                log::error!("Model driver panicked: {e}");
            }
        }
    }
}

async fn drive<T: Transport>(
    mut transport: T,
    reconciler: Arc<RwLock<Reconciler>>,
    mut outgoing_rx: mpsc::Receiver<Command>,
    state: Arc<RwLock<ConnectionState>>,
) {
    let exit = loop {
        tokio::select! {
            command = outgoing_rx.recv() => match command {
                Some(Command::Send(msg)) => {
                    let text = match msg.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!("Dropping '{}' request: {e}", msg.operation());
                            continue;
                        }
                    };
                    if let Err(e) = transport.send(text).await {
                        break DriverExit::TransportFailed(e);
                    }
                }
                // Model dropped or closed
                Some(Command::Close) | None => break DriverExit::ClosedLocally,
            },
            inbound = transport.recv() => match inbound {
                Ok(Some(text)) => {
                    if reconciler.write().await.handle_text(&text).await.is_err() {
                        break DriverExit::Rejected;
                    }
                }
                Ok(None) => break DriverExit::ClosedRemotely,
                Err(e @ ProtocolError::Deserialization(_)) => {
                    reconciler.read().await.reject(e).await;
                }
                Err(e) => break DriverExit::TransportFailed(e),
            },
        }
    };

    // Requests fail from here on, before subscribers see the terminal event.
    drop(outgoing_rx);

    match exit {
        DriverExit::ClosedLocally => {
            *state.write().await = ConnectionState::Disconnected;
            if let Err(e) = transport.close().await {
                log::debug!("Close failed: {e}");
            }
            reconciler.write().await.close().await;
        }
        DriverExit::ClosedRemotely => {
            log::info!("Remote closed the connection");
            *state.write().await = ConnectionState::Disconnected;
            reconciler.write().await.close().await;
        }
        DriverExit::TransportFailed(e) => {
            *state.write().await = ConnectionState::Failed;
            reconciler.read().await.fail(e).await;
        }
        DriverExit::Rejected => {
            // Stream already carries the error.
            *state.write().await = ConnectionState::Failed;
            let _ = transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::SnapshotEvent;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn model() -> (RemoteModel, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        (RemoteModel::with_transport(transport, &ClientConfig::default()), peer)
    }

    async fn next_event(sub: &mut Subscription) -> SnapshotEvent {
        timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    async fn next_items(sub: &mut Subscription) -> Vec<Value> {
        match next_event(sub).await {
            SnapshotEvent::Items(records) => records.as_ref().clone(),
            other => panic!("Expected items, got {other:?}"),
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.key_field, "id");
        assert_eq!(config.outgoing_capacity, 256);

        let config = ClientConfig::new("ws://example:1/people");
        assert_eq!(config.url, "ws://example:1/people");
        assert_eq!(config.key_field, "id");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (model, _peer) = model();
        assert_eq!(model.connection_state().await, ConnectionState::Connected);
        assert_eq!(model.key_field().await, "id");

        let mut items = model.items().await;
        assert!(next_items(&mut items).await.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_patches_published() {
        let (model, peer) = model();
        let mut items = model.items().await;
        let _ = next_items(&mut items).await;

        peer.send_text(r#"{"operation":"data","items":{"1":{"id":"1","v":"a"}}}"#)
            .unwrap();
        assert_eq!(next_items(&mut items).await, vec![json!({"id": "1", "v": "a"})]);

        peer.send_text(r#"{"operation":"inserted","items":{"2":{"id":"2","v":"b"}}}"#)
            .unwrap();
        assert_eq!(
            next_items(&mut items).await,
            vec![json!({"id": "1", "v": "a"}), json!({"id": "2", "v": "b"})]
        );
    }

    #[tokio::test]
    async fn test_edit_sends_without_local_change() {
        let (model, mut peer) = model();
        peer.send_text(r#"{"operation":"data","items":{"1":{"id":"1","v":"a"}}}"#)
            .unwrap();
        let mut items = model.items().await;
        // Wait until the snapshot has landed
        while next_items(&mut items).await.is_empty() {}

        model.edit_item(json!({"id": "1", "v": "z"})).await.unwrap();
        let sent = timeout(Duration::from_secs(2), peer.recv()).await.unwrap();
        assert_eq!(
            sent,
            Some(Ok(PatchMessage::change_data("1".into(), json!({"id": "1", "v": "z"}))))
        );
        assert_eq!(*model.latest().await, vec![json!({"id": "1", "v": "a"})]);
    }

    #[tokio::test]
    async fn test_insert_and_remove_requests() {
        let (model, mut peer) = model();

        model.insert_item(json!({"v": "new"})).await.unwrap();
        model.remove_item("4").await.unwrap();

        let insert = timeout(Duration::from_secs(2), peer.recv()).await.unwrap();
        assert_eq!(insert, Some(Ok(PatchMessage::insert_unkeyed(json!({"v": "new"})))));
        let remove = timeout(Duration::from_secs(2), peer.recv()).await.unwrap();
        assert_eq!(remove, Some(Ok(PatchMessage::remove("4"))));
    }

    #[tokio::test]
    async fn test_remote_close_completes() {
        let (model, mut peer) = model();
        let mut items = model.items().await;
        let _ = next_items(&mut items).await;

        peer.close();
        assert_eq!(next_event(&mut items).await, SnapshotEvent::Complete);

        // Driver is gone, requests fail
        let result = model.remove_item("1").await;
        assert_eq!(
            result,
            Err(SyncError::Protocol(ProtocolError::ConnectionClosed))
        );
        assert_eq!(model.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_error_fails_stream() {
        let (model, peer) = model();
        let mut items = model.items().await;
        let _ = next_items(&mut items).await;

        peer.fail(ProtocolError::Transport("reset".into())).unwrap();
        assert_eq!(
            next_event(&mut items).await,
            SnapshotEvent::Error(SyncError::Protocol(ProtocolError::Transport("reset".into())))
        );
        assert_eq!(model.connection_state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_undecodable_frame_keeps_stream_open() {
        let (model, peer) = model();
        let mut items = model.items().await;
        let _ = next_items(&mut items).await;

        peer.fail(ProtocolError::Deserialization("invalid utf-8".into()))
            .unwrap();
        peer.send_text(r#"{"operation":"data","items":{"1":{"id":"1"}}}"#)
            .unwrap();

        assert_eq!(
            next_event(&mut items).await,
            SnapshotEvent::Rejected(ProtocolError::Deserialization("invalid utf-8".into()))
        );
        assert_eq!(next_items(&mut items).await, vec![json!({"id": "1"})]);
        assert_eq!(model.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_protocol_violation_stops_driver() {
        let (model, mut peer) = model();
        let mut items = model.items().await;
        let _ = next_items(&mut items).await;

        peer.send_text(r#"{"operation":"data","items":["a"]}"#).unwrap();
        let _ = next_items(&mut items).await;
        peer.send_text(r#"{"operation":"removed","items":["a"]}"#).unwrap();

        assert!(matches!(next_event(&mut items).await, SnapshotEvent::Error(SyncError::Apply(_))));
        // Transport closed by the driver
        assert_eq!(timeout(Duration::from_secs(2), peer.recv_text()).await.unwrap(), None);
        assert_eq!(model.connection_state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_close_completes_stream() {
        let (mut model, _peer) = model();
        let mut items = model.items().await;
        let _ = next_items(&mut items).await;

        model.close().await;
        assert_eq!(next_event(&mut items).await, SnapshotEvent::Complete);
        assert_eq!(model.connection_state().await, ConnectionState::Disconnected);
    }
}
