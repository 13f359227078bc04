use crate::Identity;

/// Failure of a single object-store call.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Identity),
    #[error("already exists: {0}")]
    AlreadyExists(Identity),
    #[error("conflict on {identity}: resourceVersion {expected} is stale (current {actual})")]
    Conflict { identity: Identity, expected: String, actual: String },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}
