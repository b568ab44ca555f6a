//! # remote-model — Client-side mirror of a remotely served collection
//!
//! Keeps a local copy of a remote collection in sync over a WebSocket,
//! exposes it as a replay-latest stream, and round-trips edits back to the
//! remote.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON patches    ┌─────────────┐
//! │ RemoteModel │ ◄───────────────► │ ModelServer │
//! │ (per view)  │   text frames     │ (by path)   │
//! └──────┬──────┘                   └──────┬──────┘
//!        │                                 │
//!        ▼                                 ▼
//! ┌─────────────┐                   ┌───────────────┐
//! │ Reconciler  │                   │ BroadcastGroup│
//! │ (snapshot)  │                   │ (fan-out)     │
//! └──────┬──────┘                   └───────────────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │ReplaySubject│ ──► subscribers
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages (`operation`-tagged)
//! - [`snapshot`] — keyed / ordered snapshot and patch application
//! - [`reconciler`] — inbound patches to published records, outbound requests
//! - [`broadcast`] — replay-latest subject and server fan-out
//! - [`transport`] — transport trait, WebSocket and in-memory transports
//! - [`client`] — `RemoteModel`, the background-driven client
//! - [`server`] — `ModelServer`, serves keyed collections by request path

pub mod protocol;
pub mod snapshot;
pub mod reconciler;
pub mod broadcast;
pub mod transport;
pub mod client;
pub mod server;

// Re-exports for convenience
pub use protocol::{Items, KeyedItems, PatchMessage, ProtocolError};
pub use snapshot::{ApplyError, Mode, Operation, Snapshot};
pub use reconciler::{Reconciler, SyncError, DEFAULT_KEY_FIELD};
pub use broadcast::{BroadcastGroup, BroadcastStats, Records, ReplaySubject, SnapshotEvent, Subscription};
pub use transport::{MemoryPeer, MemoryTransport, Transport, WebSocketTransport};
pub use client::{ClientConfig, ConnectionState, RemoteModel};
pub use server::{ModelServer, ServedModel, ServerConfig, ServerStats};
