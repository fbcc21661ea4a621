use petrel_bp::BpError;

/// Node-level error taxonomy. Errors from I/O actors are converted into
/// events and surfaced on the daemon queue rather than propagated across
/// actor boundaries.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Malformed wire input; the containing session or contact is reset.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error(transparent)]
    Bp(#[from] BpError),

    /// Authentication or integrity failure.
    #[error("security: {0}")]
    Security(String),

    /// Retryable under the CLA's backoff policy.
    #[error("transient io: {0}")]
    TransientIo(String),

    /// Unrecoverable socket state; the contact is broken.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// No matching route, no registered consumer, or a full DEFER queue.
    #[error("policy: {0}")]
    Policy(String),

    /// Queue or buffer caps hit; backpressure propagates to the caller.
    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("shutting down")]
    Shutdown,
}

impl NodeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::TransientIo(_) | NodeError::Resource(_))
    }
}
