//! Test support
//!
//! A scripted payment provider, record fixtures, and a harness wiring the
//! whole engine to the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::directory::InMemoryMemberDirectory;
use crate::error::{BillingError, BillingResult};
use crate::models::{StoredAuthorization, Subscription, SubscriptionStatus, Tenant};
use crate::provider::{
    ChargeAuthorization, InitializePayment, PaymentProvider, PaymentSession, PaymentVerification,
};
use crate::store::{BillingStore, InMemoryBillingStore};
use crate::BillingService;

pub const TEST_AUTHORIZATION_CODE: &str = "AUTH_test";

#[derive(Debug, Default)]
struct MockState {
    fail_initialize: bool,
    unreachable: bool,
    decline_all: bool,
    decline_charges: bool,
    declined: HashSet<String>,
    initialized: Vec<InitializePayment>,
    verify_calls: Vec<String>,
    charges: Vec<ChargeAuthorization>,
}

/// Payment provider that approves everything unless told otherwise
#[derive(Debug, Default)]
pub struct MockPaymentProvider {
    state: Mutex<MockState>,
    unconfigured: bool,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that reports itself as not configured.
    pub fn unconfigured() -> Self {
        Self {
            state: Mutex::default(),
            unconfigured: true,
        }
    }

    pub async fn fail_initialize(&self) {
        self.state.lock().await.fail_initialize = true;
    }

    pub async fn decline(&self, reference: &str) {
        self.state.lock().await.declined.insert(reference.to_string());
    }

    pub async fn decline_all(&self) {
        self.state.lock().await.decline_all = true;
    }

    pub async fn decline_charges(&self, decline: bool) {
        self.state.lock().await.decline_charges = decline;
    }

    /// Every call fails with a provider error until reset.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    pub async fn initialized(&self) -> Vec<InitializePayment> {
        self.state.lock().await.initialized.clone()
    }

    pub async fn verify_calls(&self) -> Vec<String> {
        self.state.lock().await.verify_calls.clone()
    }

    pub async fn charges(&self) -> Vec<ChargeAuthorization> {
        self.state.lock().await.charges.clone()
    }

    fn authorization() -> StoredAuthorization {
        StoredAuthorization {
            authorization_code: TEST_AUTHORIZATION_CODE.to_string(),
            last4: Some("4081".to_string()),
            brand: Some("visa".to_string()),
        }
    }

    fn approved(reference: &str) -> PaymentVerification {
        PaymentVerification {
            reference: reference.to_string(),
            success: true,
            provider_transaction_id: Some(format!("txn_{}", reference)),
            authorization: Some(Self::authorization()),
            failure_reason: None,
        }
    }

    fn declined(reference: &str, reason: &str) -> PaymentVerification {
        PaymentVerification {
            reference: reference.to_string(),
            success: false,
            provider_transaction_id: None,
            authorization: None,
            failure_reason: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    fn is_configured(&self) -> bool {
        !self.unconfigured
    }

    async fn initialize_payment(&self, request: InitializePayment) -> BillingResult<PaymentSession> {
        let mut state = self.state.lock().await;
        if state.unreachable || state.fail_initialize {
            return Err(BillingError::PaymentProvider(
                "connection reset by peer".to_string(),
            ));
        }
        let session = PaymentSession {
            reference: request.reference.clone(),
            authorization_url: format!("https://checkout.test/{}", request.reference),
            access_code: Some(format!("ac_{}", request.reference)),
        };
        state.initialized.push(request);
        Ok(session)
    }

    async fn verify_payment(&self, reference: &str) -> BillingResult<PaymentVerification> {
        let mut state = self.state.lock().await;
        state.verify_calls.push(reference.to_string());
        if state.unreachable {
            return Err(BillingError::PaymentProvider(
                "connection reset by peer".to_string(),
            ));
        }
        if state.decline_all || state.declined.contains(reference) {
            return Ok(Self::declined(reference, "Declined by issuer"));
        }
        Ok(Self::approved(reference))
    }

    async fn charge_authorization(
        &self,
        request: ChargeAuthorization,
    ) -> BillingResult<PaymentVerification> {
        let mut state = self.state.lock().await;
        let reference = request.reference.clone();
        state.charges.push(request);
        if state.unreachable {
            return Err(BillingError::PaymentProvider(
                "connection reset by peer".to_string(),
            ));
        }
        if state.decline_charges {
            return Ok(Self::declined(&reference, "Insufficient funds"));
        }
        Ok(Self::approved(&reference))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn tenant(name: &str) -> Tenant {
    let slug = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    Tenant {
        id: Uuid::new_v4(),
        name: name.to_string(),
        email: format!("office@{}.example", slug),
        member_count_cache: 0,
        eligible_tier_id: None,
        tier_checked_at: None,
        created_at: Utc::now(),
    }
}

/// ACTIVE subscription halfway through a 30-day period.
pub fn active_subscription(
    tenant_id: Uuid,
    tier_id: Uuid,
    interval_id: Uuid,
    amount: Decimal,
) -> Subscription {
    let today = Utc::now().date_naive();
    let mut sub = Subscription::new(
        tenant_id,
        SubscriptionStatus::Active,
        today - Duration::days(15),
        today + Duration::days(15),
        7,
    );
    sub.tier_id = Some(tier_id);
    sub.interval_id = Some(interval_id);
    sub.amount = amount;
    sub
}

/// ACTIVE subscription still on a storage-based legacy plan.
pub fn legacy_subscription(tenant_id: Uuid, legacy_plan_id: Uuid, amount: Decimal) -> Subscription {
    let today = Utc::now().date_naive();
    let mut sub = Subscription::new(
        tenant_id,
        SubscriptionStatus::Active,
        today - Duration::days(10),
        today + Duration::days(20),
        7,
    );
    sub.legacy_plan_id = Some(legacy_plan_id);
    sub.amount = amount;
    sub
}

// =============================================================================
// Harness
// =============================================================================

/// The full engine over in-memory collaborators
pub struct TestHarness {
    pub store: Arc<InMemoryBillingStore>,
    pub members: Arc<InMemoryMemberDirectory>,
    pub provider: Arc<MockPaymentProvider>,
    pub billing: BillingService,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig::default())
    }

    pub fn with_config(config: BillingConfig) -> Self {
        Self::with_provider(config, MockPaymentProvider::new())
    }

    pub fn with_provider(config: BillingConfig, provider: MockPaymentProvider) -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let members = Arc::new(InMemoryMemberDirectory::new());
        let provider = Arc::new(provider);
        let billing = BillingService::new(store.clone(), members.clone(), provider.clone(), config);
        Self {
            store,
            members,
            provider,
            billing,
        }
    }

    /// Register a church with `member_count` active members and no subscription.
    pub async fn add_church(&self, name: &str, member_count: i64) -> Tenant {
        let church = tenant(name);
        self.store.insert_tenant(church.clone()).await;
        self.members.set_count(church.id, member_count).await;
        church
    }

    /// Register a church already paying for `tier_id` at `interval_id`.
    pub async fn add_active_church(
        &self,
        name: &str,
        member_count: i64,
        tier_id: Uuid,
        interval_id: Uuid,
    ) -> BillingResult<Tenant> {
        let church = self.add_church(name, member_count).await;
        let tier = self.store.require_tier(tier_id).await?;
        let interval = self.store.require_interval(interval_id).await?;
        let mut sub = active_subscription(church.id, tier_id, interval_id, tier.price_for(interval.name));
        sub.authorization = Some(MockPaymentProvider::authorization());
        self.store.seed_subscription(sub).await;
        Ok(church)
    }

    pub async fn subscription(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.store.require_subscription(tenant_id).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
