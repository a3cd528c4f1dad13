// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Steward Billing Module
//!
//! Congregation pricing and subscription billing for churches.
//!
//! ## Features
//!
//! - **Tier Catalog**: Member-count pricing tiers with per-interval prices and discounts
//! - **Pricing**: Resolve and assign the tier a church's congregation size calls for
//! - **Proration**: Mid-cycle credit and charge for tier and interval changes
//! - **Upgrades**: Two-phase quote, pay, commit with a single pending upgrade per church
//! - **Subscriptions**: Trials, activation, cancellation, credits, renewal and suspension sweeps
//! - **Recurring Charges**: Stored-card retries with exponential backoff
//! - **Migration**: Auditable, reversible move off the storage-based legacy plans
//! - **Add-ons**: Prorated storage add-ons that renew with the subscription
//! - **Invariants**: Read-only consistency checks over billing state

pub mod addons;
pub mod catalog;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod invariants;
pub mod migration;
pub mod models;
pub mod money;
pub mod pricing;
pub mod proration;
pub mod provider;
pub mod store;
pub mod subscriptions;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod upgrade;
pub mod webhooks;


// Add-ons
pub use addons::{AddonPurchase, AddonQuote, AddonService};

// Catalog
pub use catalog::{BillingInterval, IntervalName, PricingTier, TierCatalog};

// Config
pub use config::{BillingConfig, RetryPolicy};

// Directory
pub use directory::{InMemoryMemberDirectory, MemberDirectory, PgMemberDirectory};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEvent, BillingEventBuilder, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Migration
pub use migration::{
    BulkMigrationReport, MigrationFailure, MigrationReportRow, MigrationService,
    MigrationStatusSummary,
};

// Models
pub use models::{
    AddonStatus, ChangeType, LegacyPlan, MigrationStatus, Payment, PaymentMetadata,
    PaymentStatus, PaymentType, PricingModelMigration, StorageAddon, Subscription,
    SubscriptionStatus, Tenant, TenantStorageAddon, TierChangeHistory, TierChangeStatus,
};

// Money
pub use money::{CurrencyConverter, FixedRateConverter};

// Pricing
pub use pricing::{IntervalPrice, PricingService, PricingSummary};

// Proration
pub use proration::{ProrationEngine, ProrationResult};

// Provider
pub use provider::{PaymentProvider, PaymentVerification, UnconfiguredPaymentProvider};

// Store
pub use store::{BillingStore, ChangeSet, InMemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{
    CreditStatus, RenewalReport, RetryOutcome, RetryReport, SubscriptionPayment,
    SubscriptionService, SuspensionReport, SweepFailure,
};

// Upgrades
pub use upgrade::{ReconcileReport, TierUpgradeOrchestrator, UpgradeInitiation, UpgradeRequest};

// Webhooks
pub use webhooks::{CallbackOutcome, PaymentCallbackHandler};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub pricing: PricingService,
    pub proration: ProrationEngine,
    pub upgrades: TierUpgradeOrchestrator,
    pub subscriptions: SubscriptionService,
    pub migrations: MigrationService,
    pub addons: AddonService,
    pub callbacks: PaymentCallbackHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service backed by Postgres, configured from environment variables
    pub fn from_env(pool: PgPool, provider: Arc<dyn PaymentProvider>) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
        let members: Arc<dyn MemberDirectory> = Arc::new(PgMemberDirectory::new(pool));
        Ok(Self::new(store, members, provider, config))
    }

    /// Create a billing service with explicit collaborators, converting at the configured rate
    pub fn new(
        store: Arc<dyn BillingStore>,
        members: Arc<dyn MemberDirectory>,
        provider: Arc<dyn PaymentProvider>,
        config: BillingConfig,
    ) -> Self {
        let converter: Arc<dyn CurrencyConverter> = Arc::new(FixedRateConverter::new(
            config.payment_currency.clone(),
            config.usd_exchange_rate,
        ));
        Self::with_converter(store, members, provider, converter, config)
    }

    pub fn with_converter(
        store: Arc<dyn BillingStore>,
        members: Arc<dyn MemberDirectory>,
        provider: Arc<dyn PaymentProvider>,
        converter: Arc<dyn CurrencyConverter>,
        config: BillingConfig,
    ) -> Self {
        let pricing = PricingService::new(
            store.clone(),
            members.clone(),
            converter.clone(),
            config.upgrade_threshold_percent,
        );
        let proration = ProrationEngine::new(store.clone(), converter.clone());
        let upgrades = TierUpgradeOrchestrator::new(
            store.clone(),
            members.clone(),
            provider.clone(),
            proration.clone(),
            config.clone(),
        );
        let subscriptions = SubscriptionService::new(
            store.clone(),
            members.clone(),
            provider.clone(),
            converter.clone(),
            config.clone(),
        );
        let migrations = MigrationService::new(store.clone(), members, pricing.clone());
        let addons = AddonService::new(store.clone(), provider, converter, config);
        let callbacks = PaymentCallbackHandler::new(
            store.clone(),
            subscriptions.clone(),
            upgrades.clone(),
            addons.clone(),
        );
        let invariants = InvariantChecker::new(store);

        Self {
            pricing,
            proration,
            upgrades,
            subscriptions,
            migrations,
            addons,
            callbacks,
            invariants,
        }
    }
}
