//! Error types for Steward

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StewardError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Record belongs to church {actual}, expected {expected}")]
    TenantMismatch { expected: Uuid, actual: Uuid },

    #[error("Internal error: {0}")]
    Internal(String),
}
