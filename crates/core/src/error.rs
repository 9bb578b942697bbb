use thiserror::Error;

pub type CohortResult<T> = Result<T, CohortError>;

#[derive(Error, Debug)]
pub enum CohortError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate slug: {0}")]
    Duplicate(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("store call timed out after {0}ms")]
    Timeout(u64),

    /// The add batch of an update committed, but a later step failed.
    /// `added` rows are already durable and are reported back to the caller.
    #[error("{added} segment(s) added but update did not complete: {reason}")]
    PartialUpdate { added: u64, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CohortError {
    /// True for errors caused by the caller's input rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CohortError::NotFound(_) | CohortError::Duplicate(_) | CohortError::Invalid(_)
        )
    }
}
