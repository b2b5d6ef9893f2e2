//! Error taxonomy every backend adapter reports in.

/// Errors a backend adapter surfaces to the room manager.
///
/// Adapters translate engine-specific failures into these classes so
/// the manager can decide what to retry without knowing which engine
/// it talks to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The instance (or image) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine refused because of a conflicting object (e.g. a
    /// container name already in use).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The engine ran out of capacity (ports, memory, quota).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The engine did not answer in time.
    #[error("backend timed out: {0}")]
    Timeout(String),

    /// The engine is unreachable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Any other engine failure.
    #[error("backend failure: {0}")]
    Failed(String),
}

impl BackendError {
    /// Returns `true` for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}
