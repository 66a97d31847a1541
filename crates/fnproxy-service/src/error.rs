//! LSS's own error type: every component it dispatches into already returns
//! [`fnproxy_core::ProxyError`] or an infallible fallback response, so this
//! exists mainly to give the façade's own operations (topology-view
//! bookkeeping, dispatch plumbing) a place to report errors that converts
//! cleanly at the boundary.

use thiserror::Error;

/// A result type using [`LssError`].
pub type Result<T> = std::result::Result<T, LssError>;

/// Errors surfaced by the façade itself, on top of whatever FAM/BM/IC report.
#[derive(Debug, Error)]
pub enum LssError {
    /// A downstream component (FAM/BM/IC) reported a failure.
    #[error(transparent)]
    Proxy(#[from] fnproxy_core::ProxyError),

    /// The request payload could not be interpreted.
    #[error("malformed request: {0}")]
    Malformed(String),
}
