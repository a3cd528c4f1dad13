//! Billing records
//!
//! Every church-scoped record implements [`Tenantable`] so callers can run the
//! shared tenant check before acting on it.

use chrono::{DateTime, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use steward_shared::Tenantable;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::proration::ProrationResult;

/// Add whole calendar months to a date, clamping to the end of shorter months.
pub fn add_months(date: NaiveDate, months: u32) -> BillingResult<NaiveDate> {
    date.checked_add_months(Months::new(months)).ok_or_else(|| {
        BillingError::Internal(format!("Date overflow adding {} months to {}", months, date))
    })
}

macro_rules! status_str {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Suspended,
    Canceled,
}

status_str!(SubscriptionStatus {
    Trialing => "TRIALING",
    Active => "ACTIVE",
    PastDue => "PAST_DUE",
    Suspended => "SUSPENDED",
    Canceled => "CANCELED",
});

/// Card authorization returned by the provider, reusable for recurring charges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAuthorization {
    pub authorization_code: String,
    pub last4: Option<String>,
    pub brand: Option<String>,
}

/// Marker for the single in-flight upgrade a subscription may carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpgrade {
    pub tier_id: Uuid,
    pub interval_id: Uuid,
    pub reference: String,
    pub initiated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub tier_id: Option<Uuid>,
    pub interval_id: Option<Uuid>,
    /// Plan from the storage-based pricing model, cleared once migrated
    pub legacy_plan_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<NaiveDate>,
    pub current_period_start: NaiveDate,
    pub current_period_end: NaiveDate,
    pub next_billing_date: NaiveDate,
    /// Cached USD price of the current tier at the current interval
    pub amount: Decimal,
    pub auto_renew: bool,
    pub grace_period_days: i32,
    pub failed_payment_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub free_months_remaining: i32,
    pub credit_note: Option<String>,
    pub credit_granted_by: Option<Uuid>,
    pub credit_granted_at: Option<DateTime<Utc>>,
    pub credit_revoked_reason: Option<String>,
    pub authorization: Option<StoredAuthorization>,
    pub pending_upgrade: Option<PendingUpgrade>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// A fresh subscription with no tier, credit, or failure history.
    pub fn new(
        tenant_id: Uuid,
        status: SubscriptionStatus,
        period_start: NaiveDate,
        next_billing_date: NaiveDate,
        grace_period_days: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            tier_id: None,
            interval_id: None,
            legacy_plan_id: None,
            status,
            trial_ends_at: None,
            current_period_start: period_start,
            current_period_end: next_billing_date,
            next_billing_date,
            amount: Decimal::ZERO,
            auto_renew: true,
            grace_period_days,
            failed_payment_attempts: 0,
            next_retry_at: None,
            free_months_remaining: 0,
            credit_note: None,
            credit_granted_by: None,
            credit_granted_at: None,
            credit_revoked_reason: None,
            authorization: None,
            pending_upgrade: None,
            canceled_at: None,
            cancel_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_pending_upgrade(&self) -> bool {
        self.pending_upgrade.is_some()
    }

    pub fn pending_reference(&self) -> Option<&str> {
        self.pending_upgrade.as_ref().map(|p| p.reference.as_str())
    }

    /// Whether the church can use paid features on `today`.
    ///
    /// Canceled subscriptions keep access until the end of the paid period.
    pub fn has_access(&self, today: NaiveDate) -> bool {
        match self.status {
            SubscriptionStatus::Trialing | SubscriptionStatus::Active => true,
            SubscriptionStatus::PastDue => {
                let grace = chrono::Duration::days(i64::from(self.grace_period_days));
                today <= self.next_billing_date + grace
            }
            SubscriptionStatus::Canceled => today <= self.current_period_end,
            SubscriptionStatus::Suspended => false,
        }
    }

    /// Start a new period at the current billing date, `months` long.
    pub fn advance_period(&mut self, months: u32) -> BillingResult<()> {
        let start = self.next_billing_date;
        let end = add_months(start, months)?;
        self.current_period_start = start;
        self.current_period_end = end;
        self.next_billing_date = end;
        Ok(())
    }

    /// Clear failure bookkeeping after a successful charge or credit.
    pub fn reset_failures(&mut self) {
        self.failed_payment_attempts = 0;
        self.next_retry_at = None;
    }
}

impl Tenantable for Subscription {
    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }
}

/// Filter for subscription sweeps
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub statuses: Vec<SubscriptionStatus>,
    pub next_billing_on_or_before: Option<NaiveDate>,
    pub auto_renew: Option<bool>,
    pub retry_due_at_or_before: Option<DateTime<Utc>>,
    pub has_pending_upgrade: Option<bool>,
}

impl SubscriptionFilter {
    pub fn with_statuses(statuses: &[SubscriptionStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn matches(&self, sub: &Subscription) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&sub.status))
            && self
                .next_billing_on_or_before
                .map_or(true, |d| sub.next_billing_date <= d)
            && self.auto_renew.map_or(true, |a| sub.auto_renew == a)
            && self
                .retry_due_at_or_before
                .map_or(true, |t| sub.next_retry_at.is_some_and(|r| r <= t))
            && self
                .has_pending_upgrade
                .map_or(true, |p| sub.has_pending_upgrade() == p)
    }
}

// =============================================================================
// Tenant
// =============================================================================

/// The billing view of a church
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// Member count observed at the last tier assignment
    pub member_count_cache: i64,
    pub eligible_tier_id: Option<Uuid>,
    pub tier_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Tenantable for Tenant {
    fn tenant_id(&self) -> Uuid {
        self.id
    }
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

status_str!(PaymentStatus {
    Pending => "PENDING",
    Success => "SUCCESS",
    Failed => "FAILED",
});

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Subscription,
    TierUpgrade,
    StorageAddon,
    RecurringCharge,
}

status_str!(PaymentType {
    Subscription => "SUBSCRIPTION",
    TierUpgrade => "TIER_UPGRADE",
    StorageAddon => "STORAGE_ADDON",
    RecurringCharge => "RECURRING_CHARGE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    TierUpgrade,
    IntervalChange,
    Combined,
}

status_str!(ChangeType {
    TierUpgrade => "TIER_UPGRADE",
    IntervalChange => "INTERVAL_CHANGE",
    Combined => "COMBINED",
});

/// Typed metadata attached to every payment, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMetadata {
    Subscription {
        tier_id: Uuid,
        interval_id: Uuid,
    },
    TierUpgrade {
        tier_change_id: Uuid,
        new_tier_id: Uuid,
        new_interval_id: Uuid,
        change_type: ChangeType,
    },
    StorageAddon {
        addon_id: Uuid,
        prorated: bool,
        days_remaining: i64,
        full_price_usd: Decimal,
    },
    RecurringCharge {
        period_start: NaiveDate,
        attempt: i32,
    },
}

impl PaymentMetadata {
    pub fn payment_type(&self) -> PaymentType {
        match self {
            PaymentMetadata::Subscription { .. } => PaymentType::Subscription,
            PaymentMetadata::TierUpgrade { .. } => PaymentType::TierUpgrade,
            PaymentMetadata::StorageAddon { .. } => PaymentType::StorageAddon,
            PaymentMetadata::RecurringCharge { .. } => PaymentType::RecurringCharge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Option<Uuid>,
    /// Unique, provider-correlated reference
    pub reference: String,
    /// Amount in `currency`
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub metadata: PaymentMetadata,
    pub provider_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn pending(
        tenant_id: Uuid,
        subscription_id: Option<Uuid>,
        reference: String,
        amount: Decimal,
        currency: &str,
        metadata: PaymentMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            subscription_id,
            reference,
            amount,
            currency: currency.to_string(),
            status: PaymentStatus::Pending,
            metadata,
            provider_transaction_id: None,
            failure_reason: None,
            created_at: Utc::now(),
            verified_at: None,
        }
    }

    pub fn payment_type(&self) -> PaymentType {
        self.metadata.payment_type()
    }

    pub fn mark_success(&mut self, provider_transaction_id: Option<String>) {
        self.status = PaymentStatus::Success;
        self.provider_transaction_id = provider_transaction_id;
        self.failure_reason = None;
        self.verified_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = PaymentStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.verified_at = Some(Utc::now());
    }
}

impl Tenantable for Payment {
    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }
}

// =============================================================================
// Tier change history
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierChangeStatus {
    Pending,
    Completed,
    Failed,
}

status_str!(TierChangeStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

impl TierChangeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TierChangeStatus::Pending)
    }
}

/// One upgrade attempt. Never modified once COMPLETED or FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierChangeHistory {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub old_tier_id: Uuid,
    pub new_tier_id: Uuid,
    pub old_interval_id: Uuid,
    pub new_interval_id: Uuid,
    pub change_type: ChangeType,
    pub proration: ProrationResult,
    pub old_next_billing_date: NaiveDate,
    pub new_next_billing_date: NaiveDate,
    pub payment_reference: String,
    pub status: TierChangeStatus,
    pub reason: Option<String>,
    pub failure_reason: Option<String>,
    pub performed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TierChangeHistory {
    pub fn mark_completed(&mut self) {
        self.status = TierChangeStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TierChangeStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }
}

impl Tenantable for TierChangeHistory {
    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }
}

// =============================================================================
// Pricing model migration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Completed,
    RolledBack,
    Failed,
}

status_str!(MigrationStatus {
    Completed => "COMPLETED",
    RolledBack => "ROLLED_BACK",
    Failed => "FAILED",
});

/// Plan from the storage-based pricing model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LegacyPlan {
    pub id: Uuid,
    pub name: String,
    pub storage_limit_mb: i64,
    pub monthly_price: Decimal,
}

/// Subscription and tenant fields as they were before a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub legacy_plan_id: Option<Uuid>,
    pub amount: Decimal,
    pub tier_id: Option<Uuid>,
    pub interval_id: Option<Uuid>,
    pub member_count_cache: i64,
    pub eligible_tier_id: Option<Uuid>,
}

impl SubscriptionSnapshot {
    pub fn capture(subscription: &Subscription, tenant: &Tenant) -> Self {
        Self {
            legacy_plan_id: subscription.legacy_plan_id,
            amount: subscription.amount,
            tier_id: subscription.tier_id,
            interval_id: subscription.interval_id,
            member_count_cache: tenant.member_count_cache,
            eligible_tier_id: tenant.eligible_tier_id,
        }
    }
}

/// Audit row for one church's move from a legacy plan to a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingModelMigration {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub old_plan_id: Option<Uuid>,
    pub old_plan_name: Option<String>,
    pub old_storage_limit_mb: Option<i64>,
    pub old_monthly_price: Decimal,
    pub previous: Option<SubscriptionSnapshot>,
    pub new_tier_id: Option<Uuid>,
    pub new_member_count: i64,
    pub new_monthly_price: Decimal,
    pub status: MigrationStatus,
    pub notes: Option<String>,
    pub performed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub rolled_back_by: Option<Uuid>,
}

impl PricingModelMigration {
    pub fn price_delta(&self) -> Decimal {
        self.new_monthly_price - self.old_monthly_price
    }
}

impl Tenantable for PricingModelMigration {
    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }
}

// =============================================================================
// Storage add-ons
// =============================================================================

/// Add-on catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StorageAddon {
    pub id: Uuid,
    pub name: String,
    pub storage_mb: i64,
    /// Monthly price in USD
    pub monthly_price: Decimal,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddonStatus {
    Active,
    Canceled,
    Suspended,
}

status_str!(AddonStatus {
    Active => "ACTIVE",
    Canceled => "CANCELED",
    Suspended => "SUSPENDED",
});

/// A church's purchase of a storage add-on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantStorageAddon {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub addon_id: Uuid,
    pub status: AddonStatus,
    pub purchase_reference: String,
    /// Amount paid at purchase, USD
    pub prorated_amount: Decimal,
    /// Always equal to the base subscription's next billing date while active
    pub renewal_date: NaiveDate,
    pub activated_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Tenantable for TenantStorageAddon {
    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn subscription(status: SubscriptionStatus) -> Subscription {
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let mut sub = Subscription::new(
            Uuid::new_v4(),
            status,
            today,
            add_months(today, 1).unwrap(),
            7,
        );
        sub.amount = dec!(9.99);
        sub
    }

    #[test]
    fn test_add_months_clamps_month_end() {
        let jan31 = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(
            add_months(jan31, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
    }

    #[test]
    fn test_canceled_keeps_access_until_period_end() {
        let sub = subscription(SubscriptionStatus::Canceled);
        assert!(sub.has_access(sub.current_period_end));
        assert!(!sub.has_access(sub.current_period_end + chrono::Duration::days(1)));
    }

    #[test]
    fn test_suspended_has_no_access() {
        let sub = subscription(SubscriptionStatus::Suspended);
        assert!(!sub.has_access(sub.current_period_start));
    }

    #[test]
    fn test_advance_period() {
        let mut sub = subscription(SubscriptionStatus::Active);
        let old_next = sub.next_billing_date;
        sub.advance_period(3).unwrap();
        assert_eq!(sub.current_period_start, old_next);
        assert_eq!(sub.next_billing_date, add_months(old_next, 3).unwrap());
        assert_eq!(sub.current_period_end, sub.next_billing_date);
    }

    #[test]
    fn test_filter_matches() {
        let mut sub = subscription(SubscriptionStatus::PastDue);
        let filter = SubscriptionFilter {
            statuses: vec![SubscriptionStatus::PastDue],
            retry_due_at_or_before: Some(Utc::now()),
            ..Default::default()
        };
        assert!(!filter.matches(&sub));

        sub.next_retry_at = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(filter.matches(&sub));

        sub.status = SubscriptionStatus::Active;
        assert!(!filter.matches(&sub));
    }

    #[test]
    fn test_metadata_is_tagged() {
        let metadata = PaymentMetadata::StorageAddon {
            addon_id: Uuid::nil(),
            prorated: true,
            days_remaining: 12,
            full_price_usd: dec!(4.99),
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["type"], "STORAGE_ADDON");
        assert_eq!(json["days_remaining"], 12);
        assert_eq!(metadata.payment_type(), PaymentType::StorageAddon);

        let parsed: PaymentMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SubscriptionStatus::PastDue.to_string(), "PAST_DUE");
        assert_eq!(MigrationStatus::RolledBack.as_str(), "ROLLED_BACK");
        assert!(TierChangeStatus::Failed.is_terminal());
        assert!(!PaymentStatus::Pending.is_terminal());
    }
}
