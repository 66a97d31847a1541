//! Watch event types shared by every [`crate::MetaStore`] implementation.

use tokio::sync::mpsc;

/// Whether a watched key was written or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The key was written (created or updated).
    Put,
    /// The key was removed.
    Delete,
}

/// A single change observed on a watched key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// The kind of change.
    pub kind: WatchEventKind,
    /// The affected key.
    pub key: Vec<u8>,
    /// The value after the change; empty for `Delete`.
    pub value: Vec<u8>,
    /// The store-wide revision this change landed at.
    pub revision: i64,
}

/// A stream of [`WatchEvent`]s. Closes when the underlying watch is cancelled
/// or the connection to the store is lost; callers must re-`watch` from the
/// last observed revision to resume.
pub type WatchStream = mpsc::Receiver<WatchEvent>;
