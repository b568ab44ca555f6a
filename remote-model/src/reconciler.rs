//! The mirror reconciler.
//!
//! Owns the local snapshot. Every inbound text frame is decoded, converted
//! into an [`Operation`], applied, and the resulting records are published
//! to the [`ReplaySubject`]. Local mutations never touch the snapshot: they
//! only build the request message; the change shows up when the remote
//! echoes the matching patch back.
//!
//! ```text
//! frame ─► PatchMessage::decode ─► Operation ─► Snapshot::apply ─► publish
//!             │ (bad frame)            │ (client-only tag)  │ (mode / range)
//!             ▼                        ▼                    ▼
//!         Rejected                 Rejected              Error (terminal)
//! ```

use serde_json::Value;

use crate::broadcast::{ReplaySubject, Subscription};
use crate::protocol::{record_key, try_record_key, PatchMessage, ProtocolError};
use crate::snapshot::{ApplyError, Mode, Operation, Snapshot};

/// Key field used until a `rowData` snapshot names another one.
pub const DEFAULT_KEY_FIELD: &str = "id";

/// Terminal stream error.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Transport failure or unusable request
    Protocol(ProtocolError),
    /// Inbound patch violated the snapshot contract
    Apply(ApplyError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Apply(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<ApplyError> for SyncError {
    fn from(e: ApplyError) -> Self {
        SyncError::Apply(e)
    }
}

pub struct Reconciler {
    /// `None` until the first full replace
    snapshot: Option<Snapshot>,
    key_field: String,
    subject: ReplaySubject,
    /// Operations applied so far
    applied: u64,
}

impl Reconciler {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            snapshot: None,
            key_field: key_field.into(),
            subject: ReplaySubject::new(Vec::new()),
            applied: 0,
        }
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn mode(&self) -> Option<Mode> {
        self.snapshot.as_ref().map(Snapshot::mode)
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn subject(&self) -> &ReplaySubject {
        &self.subject
    }

    /// Subscribe to published snapshots.
    pub async fn subscribe(&self) -> Subscription {
        self.subject.subscribe().await
    }

    /// Records as they would be published now.
    pub fn records(&self) -> Vec<Value> {
        self.snapshot.as_ref().map(Snapshot::values).unwrap_or_default()
    }

    /// Apply one operation without publishing.
    pub fn apply(&mut self, op: Operation) -> Result<(), ApplyError> {
        let key_field = match &op {
            Operation::FullReplace { key_field, .. } => key_field.clone(),
            _ => None,
        };

        match self.snapshot.as_mut() {
            Some(snapshot) => snapshot.apply(op)?,
            None => match op {
                Operation::FullReplace { items, .. } => {
                    self.snapshot = Some(Snapshot::from(items));
                }
                _ => return Err(ApplyError::NoSnapshot),
            },
        }

        if let Some(key_field) = key_field {
            self.key_field = key_field;
        }
        self.applied += 1;
        Ok(())
    }

    /// Publish the current records to all subscribers.
    pub async fn publish(&self) {
        self.subject.next(self.records()).await;
    }

    /// Apply an operation and publish the result.
    ///
    /// A failed apply terminates the stream with an error.
    pub async fn apply_and_publish(&mut self, op: Operation) -> Result<(), SyncError> {
        if let Err(e) = self.apply(op) {
            log::error!("Dropping mirror: {e}");
            let error = SyncError::Apply(e);
            self.subject.error(error.clone()).await;
            return Err(error);
        }
        self.publish().await;
        Ok(())
    }

    /// Handle one inbound text frame.
    ///
    /// Undecodable frames and client-only operations are reported to
    /// subscribers and skipped. Contract violations are fatal.
    pub async fn handle_text(&mut self, text: &str) -> Result<(), SyncError> {
        let decoded = PatchMessage::decode(text).and_then(|msg| {
            let operation = msg.operation();
            Operation::try_from(msg).map(|op| (operation, op))
        });
        let (operation, op) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.reject(e).await;
                return Ok(());
            }
        };
        log::debug!("Applying '{operation}'");
        self.apply_and_publish(op).await
    }

    /// Drop one inbound frame and tell subscribers why. The stream continues.
    pub async fn reject(&self, error: ProtocolError) {
        log::warn!("Rejected inbound message: {error}");
        self.subject.reject(error).await;
    }

    /// The transport failed; terminate the stream.
    pub async fn fail(&self, error: ProtocolError) {
        log::error!("Transport error: {error}");
        self.subject.error(SyncError::Protocol(error)).await;
    }

    /// The transport closed; complete the stream and drop the snapshot.
    pub async fn close(&mut self) {
        self.snapshot = None;
        self.subject.complete().await;
    }

    /// Build an edit request for `record`.
    pub fn edit(&self, record: Value) -> Result<PatchMessage, SyncError> {
        self.require_keyed()?;
        let key = record_key(&record, &self.key_field)?;
        Ok(PatchMessage::change_data(key, record))
    }

    /// Build a remove request for `key`.
    pub fn remove(&self, key: impl Into<String>) -> Result<PatchMessage, SyncError> {
        self.require_keyed()?;
        Ok(PatchMessage::remove(key))
    }

    /// Build an insert request for `record`.
    ///
    /// Records without a key are sent as a one-element list so the remote
    /// can assign one.
    pub fn insert(&self, record: Value) -> Result<PatchMessage, SyncError> {
        match try_record_key(&record, &self.key_field)? {
            Some(key) => Ok(PatchMessage::insert_keyed(key, record)),
            None => Ok(PatchMessage::insert_unkeyed(record)),
        }
    }

    fn require_keyed(&self) -> Result<(), SyncError> {
        match self.mode() {
            Some(Mode::Ordered) => Err(SyncError::Apply(ApplyError::ModeMismatch {
                expected: Mode::Keyed,
                found: Mode::Ordered,
            })),
            _ => Ok(()),
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_FIELD)
    }
}
