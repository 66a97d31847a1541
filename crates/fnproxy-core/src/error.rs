//! Shared error taxonomy for the local scheduler.
//!
//! One enum covers the orthogonal kinds every component boundary can surface;
//! FAM/BM/IC-specific context rides in each variant's fields rather than in
//! separate per-crate error types, so a `*Response` message can carry the
//! symbolic kind verbatim.

use thiserror::Error;

/// A result type using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error kinds surfaced across FAM/BM/IC/LSS boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Malformed payload, duplicate-yet-inconsistent request, or unknown identifier shape.
    #[error("parameter error: {0}")]
    ParameterError(String),

    /// No such agent / instance / bundle at the call site.
    #[error("not found: {0}")]
    NotFound(String),

    /// Downstream RPC timed out or the peer disconnected after the retry budget was spent.
    #[error("inner communication failure: {0}")]
    InnerCommunication(String),

    /// A metastore `Put` failed.
    #[error("metastore put failed: {0}")]
    MetaStoragePutError(String),

    /// A metastore `Get` failed.
    #[error("metastore get failed: {0}")]
    MetaStorageGetError(String),

    /// A metastore `Delete` failed.
    #[error("metastore delete failed: {0}")]
    MetaStorageDeleteError(String),

    /// A downstream operation may succeed if retried within the instance's retry budget.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// The target agent has already been evicted; must not be silently retried.
    #[error("agent already evicted")]
    AgentEvicted,

    /// The local scheduler is mid-shutdown and must not be silently retried.
    #[error("local scheduler abnormal")]
    LocalSchedulerAbnormal,

    /// Scheduling decided against the request.
    #[error("resource not enough: {0}")]
    ResourceNotEnough(String),
}

impl ProxyError {
    /// Whether a caller may retry this error at all, versus treating it as a definitive
    /// terminal failure that must be surfaced verbatim.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::InnerCommunication(_) | Self::Recoverable(_))
    }

    /// Whether this error must never be retried by the caller, even transparently.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentEvicted | Self::LocalSchedulerAbnormal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(ProxyError::InnerCommunication("timeout".into()).is_retriable());
        assert!(ProxyError::Recoverable("heartbeat loss".into()).is_retriable());
        assert!(!ProxyError::NotFound("agent".into()).is_retriable());
        assert!(!ProxyError::AgentEvicted.is_retriable());
    }

    #[test]
    fn terminal_classification() {
        assert!(ProxyError::AgentEvicted.is_terminal());
        assert!(ProxyError::LocalSchedulerAbnormal.is_terminal());
        assert!(!ProxyError::ResourceNotEnough("no capacity".into()).is_terminal());
    }
}
