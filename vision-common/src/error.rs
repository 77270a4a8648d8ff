use thiserror::Error;

/// Error taxonomy shared by every engine component (spec §7).
///
/// Variants group by *kind*, not by originating module, so callers across
/// crate boundaries can match on "is this retryable" rather than threading a
/// `From` impl through every subsystem.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

pub type Result<T> = std::result::Result<T, VisionError>;

impl VisionError {
    /// True for kinds that a caller should retry with backoff rather than
    /// surface immediately (§7 propagation rule).
    pub fn is_transient(&self) -> bool {
        matches!(self, VisionError::TransientIo(_) | VisionError::Inference(_))
    }
}
