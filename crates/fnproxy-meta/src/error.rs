//! Errors for the metastore client.

use fnproxy_core::ProxyError;
use thiserror::Error;

/// A result type using [`MetaStoreError`].
pub type Result<T> = std::result::Result<T, MetaStoreError>;

/// Errors surfaced by a [`crate::MetaStore`] implementation.
#[derive(Debug, Error, Clone)]
pub enum MetaStoreError {
    /// The backing `Get` call failed.
    #[error("metastore get failed: {0}")]
    Get(String),

    /// The backing `Put` call failed.
    #[error("metastore put failed: {0}")]
    Put(String),

    /// The backing `Delete` call failed.
    #[error("metastore delete failed: {0}")]
    Delete(String),

    /// A transactional multi-op failed; none of its operations were applied.
    #[error("metastore transaction failed: {0}")]
    Txn(String),

    /// The requested watch revision has already been compacted away.
    #[error("watch revision {0} has been compacted")]
    RevisionCompacted(i64),

    /// The watch stream ended unexpectedly.
    #[error("watch stream closed: {0}")]
    WatchClosed(String),
}

impl From<MetaStoreError> for ProxyError {
    fn from(err: MetaStoreError) -> Self {
        match err {
            MetaStoreError::Get(msg) => ProxyError::MetaStorageGetError(msg),
            MetaStoreError::Put(msg) => ProxyError::MetaStoragePutError(msg),
            MetaStoreError::Delete(msg) => ProxyError::MetaStorageDeleteError(msg),
            MetaStoreError::Txn(msg) => ProxyError::MetaStoragePutError(msg),
            MetaStoreError::RevisionCompacted(rev) => {
                ProxyError::MetaStorageGetError(format!("revision {rev} compacted"))
            }
            MetaStoreError::WatchClosed(msg) => ProxyError::MetaStorageGetError(msg),
        }
    }
}
