//! Billing error types

use steward_shared::StewardError;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment verification failed for {reference}: {reason}")]
    PaymentVerificationFailed { reference: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Payment provider error: {0}")]
    PaymentProvider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable label used in logs and sweep reports
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidState(_) => "invalid_state",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::PaymentVerificationFailed { .. } => "payment_verification_failed",
            BillingError::Configuration(_) => "configuration",
            BillingError::AlreadyExists(_) => "already_exists",
            BillingError::ConcurrentModification(_) => "concurrent_modification",
            BillingError::PaymentProvider(_) => "payment_provider",
            BillingError::Database(_) => "database",
            BillingError::Internal(_) => "internal",
        }
    }

    /// Configuration defects point at bad catalog or deployment data, not user error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, BillingError::Configuration(_))
    }

    /// Errors the caller may retry after re-reading state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ConcurrentModification(_)
                | BillingError::Database(_)
                | BillingError::PaymentProvider(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("Serialization failed: {}", err))
    }
}

impl From<StewardError> for BillingError {
    fn from(err: StewardError) -> Self {
        match err {
            StewardError::NotFound(msg) => BillingError::NotFound(msg),
            StewardError::Validation(msg) => BillingError::InvalidInput(msg),
            err @ StewardError::TenantMismatch { .. } => BillingError::InvalidState(err.to_string()),
            StewardError::Internal(msg) => BillingError::Internal(msg),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
