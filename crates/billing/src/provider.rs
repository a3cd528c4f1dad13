//! Payment provider seam
//!
//! The gateway integration lives outside this crate. The engine only needs to
//! start a charge, ask whether a reference was paid, and charge a stored card.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::models::{PaymentMetadata, StoredAuthorization};

/// Request to start a hosted payment
#[derive(Debug, Clone, Serialize)]
pub struct InitializePayment {
    /// Amount in `currency`
    pub amount: Decimal,
    pub currency: String,
    pub email: String,
    pub reference: String,
    pub callback_url: String,
    pub metadata: PaymentMetadata,
}

/// Handle returned by the provider for a started payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub reference: String,
    pub authorization_url: String,
    pub access_code: Option<String>,
}

/// Provider's answer for a reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub reference: String,
    pub success: bool,
    pub provider_transaction_id: Option<String>,
    pub authorization: Option<StoredAuthorization>,
    pub failure_reason: Option<String>,
}

/// Request to charge a previously stored authorization
#[derive(Debug, Clone, Serialize)]
pub struct ChargeAuthorization {
    pub authorization_code: String,
    pub amount: Decimal,
    pub currency: String,
    pub email: String,
    pub reference: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Whether the provider can actually move money
    fn is_configured(&self) -> bool {
        true
    }

    async fn initialize_payment(&self, request: InitializePayment) -> BillingResult<PaymentSession>;

    async fn verify_payment(&self, reference: &str) -> BillingResult<PaymentVerification>;

    async fn charge_authorization(
        &self,
        request: ChargeAuthorization,
    ) -> BillingResult<PaymentVerification>;
}

/// Stand-in used when no gateway is configured. Every call fails with a
/// configuration error, so no payment is ever treated as verified.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredPaymentProvider;

impl UnconfiguredPaymentProvider {
    fn error() -> BillingError {
        BillingError::Configuration("No payment provider configured".to_string())
    }
}

#[async_trait]
impl PaymentProvider for UnconfiguredPaymentProvider {
    fn is_configured(&self) -> bool {
        false
    }

    async fn initialize_payment(&self, _request: InitializePayment) -> BillingResult<PaymentSession> {
        Err(Self::error())
    }

    async fn verify_payment(&self, _reference: &str) -> BillingResult<PaymentVerification> {
        Err(Self::error())
    }

    async fn charge_authorization(
        &self,
        _request: ChargeAuthorization,
    ) -> BillingResult<PaymentVerification> {
        Err(Self::error())
    }
}
