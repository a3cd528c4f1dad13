//! Billing Invariants Module
//!
//! Runnable consistency checks over the billing store. Run them after a sweep,
//! a callback replay, or a bulk migration to confirm nothing is left half-applied.
//!
//! Checks only read, never write. Each violation carries enough context to
//! find the rows involved.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{AddonStatus, MigrationStatus, SubscriptionFilter, TierChangeStatus};
use crate::store::BillingStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Churches affected
    pub tenant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may be in flight without a record
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: DateTime<Utc>,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// True when no violation of any severity was found
    pub healthy: bool,
}

const CHECKS: [&str; 5] = [
    "pending_marker_without_history",
    "pending_history_without_marker",
    "addon_renewal_drift",
    "migrated_without_tier",
    "amount_mismatch",
];

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = Utc::now();
        let mut violations = Vec::new();

        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed = checks_failed,
                "Billing invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "pending_marker_without_history" => self.check_pending_marker_has_history().await,
            "pending_history_without_marker" => self.check_pending_history_has_marker().await,
            "addon_renewal_drift" => self.check_addon_renewal_dates().await,
            "migrated_without_tier" => self.check_migrated_have_tier().await,
            "amount_mismatch" => self.check_amount_matches_tier().await,
            _ => Err(BillingError::InvalidInput(format!(
                "Unknown invariant check '{}'",
                name
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// Invariant 1: every pending-upgrade marker has a PENDING history row
    ///
    /// A marker without one blocks renewals forever and has no payment to reconcile.
    async fn check_pending_marker_has_history(&self) -> BillingResult<Vec<InvariantViolation>> {
        let pending: HashSet<String> = self
            .store
            .list_tier_changes(None, Some(TierChangeStatus::Pending))
            .await?
            .into_iter()
            .map(|c| c.payment_reference)
            .collect();

        Ok(self
            .store
            .list_subscriptions(&SubscriptionFilter {
                has_pending_upgrade: Some(true),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter_map(|sub| {
                let marker = sub.pending_upgrade?;
                if pending.contains(&marker.reference) {
                    return None;
                }
                Some(InvariantViolation {
                    invariant: "pending_marker_without_history".to_string(),
                    tenant_ids: vec![sub.tenant_id],
                    description: format!(
                        "Subscription {} is marked pending on {} with no PENDING tier change",
                        sub.id, marker.reference
                    ),
                    context: serde_json::json!({
                        "subscription_id": sub.id,
                        "reference": marker.reference,
                        "initiated_at": marker.initiated_at,
                    }),
                    severity: ViolationSeverity::Critical,
                })
            })
            .collect())
    }

    /// Invariant 2: every PENDING history row is the subscription's current marker
    async fn check_pending_history_has_marker(&self) -> BillingResult<Vec<InvariantViolation>> {
        let markers: HashMap<Uuid, String> = self
            .store
            .list_subscriptions(&SubscriptionFilter::default())
            .await?
            .into_iter()
            .filter_map(|sub| {
                let reference = sub.pending_reference()?.to_string();
                Some((sub.id, reference))
            })
            .collect();

        Ok(self
            .store
            .list_tier_changes(None, Some(TierChangeStatus::Pending))
            .await?
            .into_iter()
            .filter(|change| {
                markers.get(&change.subscription_id) != Some(&change.payment_reference)
            })
            .map(|change| InvariantViolation {
                invariant: "pending_history_without_marker".to_string(),
                tenant_ids: vec![change.tenant_id],
                description: format!(
                    "Tier change {} is PENDING but subscription {} is not waiting on it",
                    change.payment_reference, change.subscription_id
                ),
                context: serde_json::json!({
                    "tier_change_id": change.id,
                    "subscription_id": change.subscription_id,
                    "reference": change.payment_reference,
                    "created_at": change.created_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: active add-ons renew with the base subscription
    async fn check_addon_renewal_dates(&self) -> BillingResult<Vec<InvariantViolation>> {
        let next_billing: HashMap<Uuid, chrono::NaiveDate> = self
            .store
            .list_subscriptions(&SubscriptionFilter::default())
            .await?
            .into_iter()
            .map(|sub| (sub.id, sub.next_billing_date))
            .collect();

        Ok(self
            .store
            .list_tenant_addons(None)
            .await?
            .into_iter()
            .filter(|addon| addon.status == AddonStatus::Active)
            .filter_map(|addon| {
                let expected = next_billing.get(&addon.subscription_id).copied();
                if expected == Some(addon.renewal_date) {
                    return None;
                }
                Some(InvariantViolation {
                    invariant: "addon_renewal_drift".to_string(),
                    tenant_ids: vec![addon.tenant_id],
                    description: format!(
                        "Add-on {} renews on {} but its subscription bills on {:?}",
                        addon.id, addon.renewal_date, expected
                    ),
                    context: serde_json::json!({
                        "tenant_addon_id": addon.id,
                        "renewal_date": addon.renewal_date,
                        "next_billing_date": expected,
                    }),
                    severity: ViolationSeverity::Medium,
                })
            })
            .collect())
    }

    /// Invariant 4: a church whose latest migration is COMPLETED has a tier
    async fn check_migrated_have_tier(&self) -> BillingResult<Vec<InvariantViolation>> {
        // newest first, so the first non-failed row per church is its latest
        let mut latest: HashMap<Uuid, MigrationStatus> = HashMap::new();
        for migration in self.store.list_migrations(None).await? {
            if migration.status != MigrationStatus::Failed {
                latest.entry(migration.tenant_id).or_insert(migration.status);
            }
        }

        Ok(self
            .store
            .list_subscriptions(&SubscriptionFilter::default())
            .await?
            .into_iter()
            .filter(|sub| {
                latest.get(&sub.tenant_id) == Some(&MigrationStatus::Completed)
                    && (sub.tier_id.is_none() || sub.interval_id.is_none())
            })
            .map(|sub| InvariantViolation {
                invariant: "migrated_without_tier".to_string(),
                tenant_ids: vec![sub.tenant_id],
                description: format!(
                    "Church {} is migrated but subscription {} has no tier or interval",
                    sub.tenant_id, sub.id
                ),
                context: serde_json::json!({
                    "subscription_id": sub.id,
                    "tier_id": sub.tier_id,
                    "interval_id": sub.interval_id,
                    "legacy_plan_id": sub.legacy_plan_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: the cached amount is the tier's price for the interval
    async fn check_amount_matches_tier(&self) -> BillingResult<Vec<InvariantViolation>> {
        let catalog = self.store.catalog().await?;

        Ok(self
            .store
            .list_subscriptions(&SubscriptionFilter::default())
            .await?
            .into_iter()
            .filter_map(|sub| {
                let tier = catalog.tier(sub.tier_id?)?;
                let interval = catalog.interval(sub.interval_id?)?;
                let expected = tier.price_for(interval.name);
                if expected == sub.amount {
                    return None;
                }
                Some(InvariantViolation {
                    invariant: "amount_mismatch".to_string(),
                    tenant_ids: vec![sub.tenant_id],
                    description: format!(
                        "Subscription {} charges {} but {} {} costs {}",
                        sub.id, sub.amount, tier.name, interval.name, expected
                    ),
                    context: serde_json::json!({
                        "subscription_id": sub.id,
                        "amount": sub.amount,
                        "expected": expected,
                        "tier": tier.name,
                        "interval": interval.name,
                    }),
                    severity: ViolationSeverity::Medium,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, STANDARD_TIER_ID};
    use crate::models::{PendingUpgrade, TenantStorageAddon};
    use crate::testing::TestHarness;
    use crate::upgrade::UpgradeRequest;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"pending_marker_without_history"));
        assert!(checks.contains(&"addon_renewal_drift"));
    }

    #[tokio::test]
    async fn test_consistent_state_is_healthy() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Calvary", 120, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        h.billing
            .upgrades
            .initiate(UpgradeRequest {
                tenant_id: church.id,
                new_tier_id: STANDARD_TIER_ID,
                new_interval_id: None,
                email: church.email.clone(),
                performed_by: None,
                reason: None,
            })
            .await
            .unwrap();

        let summary = h.billing.invariants.run_all_checks().await.unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
        assert_eq!(summary.checks_run, 5);
        assert_eq!(summary.checks_passed, 5);
    }

    #[tokio::test]
    async fn test_orphan_pending_marker_is_critical() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Emmanuel", 120, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.pending_upgrade = Some(PendingUpgrade {
            tier_id: STANDARD_TIER_ID,
            interval_id: MONTHLY_INTERVAL_ID,
            reference: "TU-orphan".to_string(),
            initiated_at: Utc::now(),
        });
        h.store.seed_subscription(sub).await;

        let violations = h
            .billing
            .invariants
            .run_check("pending_marker_without_history")
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);
        assert_eq!(violations[0].tenant_ids, vec![church.id]);
    }

    #[tokio::test]
    async fn test_drift_and_amount_mismatch_reported() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Bethany", 120, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.amount = dec!(8.00);
        h.store.seed_subscription(sub.clone()).await;
        h.store
            .seed_tenant_addon(TenantStorageAddon {
                id: Uuid::new_v4(),
                tenant_id: church.id,
                subscription_id: sub.id,
                addon_id: Uuid::new_v4(),
                status: AddonStatus::Active,
                purchase_reference: "SA-drifted".to_string(),
                prorated_amount: dec!(2.50),
                renewal_date: sub.next_billing_date - Duration::days(3),
                activated_at: Utc::now(),
                canceled_at: None,
            })
            .await;

        let summary = h.billing.invariants.run_all_checks().await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 2);
        let names: HashSet<&str> = summary
            .violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect();
        assert!(names.contains("addon_renewal_drift"));
        assert!(names.contains("amount_mismatch"));
    }

    #[tokio::test]
    async fn test_unknown_check_rejected() {
        let h = TestHarness::new();
        let err = h.billing.invariants.run_check("no_such_check").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
}
