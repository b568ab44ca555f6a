//! Snapshot fan-out.
//!
//! - [`ReplaySubject`] — client side. Remembers the latest published
//!   snapshot, hands it to every new subscriber, then forwards each update
//!   to all observers in registration order. Error/complete are terminal.
//! - [`BroadcastGroup`] — server side. One tokio broadcast channel per served
//!   model; every connection on that model receives every encoded patch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::reconciler::SyncError;

/// A published snapshot. Shared, never mutated after publish.
pub type Records = Arc<Vec<Value>>;

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent {
    /// Latest snapshot
    Items(Records),
    /// An inbound message was dropped; the stream continues
    Rejected(ProtocolError),
    /// Terminal failure
    Error(SyncError),
    /// Terminal completion
    Complete,
}

impl SnapshotEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SnapshotEvent::Error(_) | SnapshotEvent::Complete)
    }
}

struct SubjectState {
    latest: Records,
    terminal: Option<SnapshotEvent>,
    observers: Vec<mpsc::UnboundedSender<SnapshotEvent>>,
}

impl SubjectState {
    /// Send to every observer, dropping the ones whose receiver is gone.
    fn fan_out(&mut self, event: &SnapshotEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Replay-latest, multi-subscriber notification primitive.
#[derive(Clone)]
pub struct ReplaySubject {
    state: Arc<Mutex<SubjectState>>,
}

impl ReplaySubject {
    /// Create a subject whose first replayed value is `initial`.
    pub fn new(initial: Vec<Value>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                latest: Arc::new(initial),
                terminal: None,
                observers: Vec::new(),
            })),
        }
    }

    /// Register an observer.
    ///
    /// The latest snapshot is queued immediately. After termination only the
    /// terminal signal is delivered.
    pub async fn subscribe(&self) -> Subscription {
        let mut state = self.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(terminal) = &state.terminal {
            // Receiver still gets the signal; tx is dropped right after.
            let _ = tx.send(terminal.clone());
        } else {
            let _ = tx.send(SnapshotEvent::Items(state.latest.clone()));
            state.observers.push(tx);
        }

        Subscription { rx }
    }

    /// Publish a new snapshot. Ignored once terminated.
    pub async fn next(&self, records: Vec<Value>) {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return;
        }
        let records = Arc::new(records);
        state.latest = records.clone();
        state.fan_out(&SnapshotEvent::Items(records));
    }

    /// Report a dropped inbound message without terminating.
    pub async fn reject(&self, error: ProtocolError) {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return;
        }
        state.fan_out(&SnapshotEvent::Rejected(error));
    }

    /// Terminate with an error and unregister all observers.
    pub async fn error(&self, error: SyncError) {
        self.terminate(SnapshotEvent::Error(error)).await;
    }

    /// Terminate with completion and unregister all observers.
    pub async fn complete(&self) {
        self.terminate(SnapshotEvent::Complete).await;
    }

    async fn terminate(&self, event: SnapshotEvent) {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return;
        }
        state.fan_out(&event);
        state.observers.clear();
        state.terminal = Some(event);
    }

    /// The most recently published snapshot.
    pub async fn latest(&self) -> Records {
        self.state.lock().await.latest.clone()
    }

    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.terminal.is_some()
    }

    /// Number of live observers.
    pub async fn observer_count(&self) -> usize {
        self.state.lock().await.observers.len()
    }
}

/// Receiving half of a [`ReplaySubject`] registration.
///
/// Yields `None` after the terminal event.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SnapshotEvent>,
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<SnapshotEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SnapshotEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = SnapshotEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_connections: usize,
}

/// Fan-out of encoded patches to every connection serving one model.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<String>>,

    /// Connection id → remote address
    connections: RwLock<HashMap<Uuid, SocketAddr>>,

    capacity: usize,

    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the per-receiver buffer; lagging receivers lose messages.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn join(&self, id: Uuid, addr: SocketAddr) -> broadcast::Receiver<Arc<String>> {
        self.connections.write().await.insert(id, addr);
        self.sender.subscribe()
    }

    pub async fn leave(&self, id: &Uuid) -> Option<SocketAddr> {
        self.connections.write().await.remove(id)
    }

    /// Broadcast an encoded message, returning the number of receivers.
    pub fn broadcast(&self, encoded: Arc<String>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
