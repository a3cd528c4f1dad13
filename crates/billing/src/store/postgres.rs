//! Postgres billing store
//!
//! Each `apply` runs in one transaction. Subscription updates lock the row
//! with `FOR UPDATE` and re-check the version; the single-pending-change and
//! single-completed-migration guards are backed by partial unique indexes.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{BillingStore, ChangeSet, Write};
use crate::catalog::{BillingInterval, PricingTier};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ChangeType, LegacyPlan, MigrationStatus, Payment, PaymentMetadata, PaymentStatus,
    PendingUpgrade, PricingModelMigration, StorageAddon, StoredAuthorization, Subscription,
    SubscriptionFilter, SubscriptionSnapshot, SubscriptionStatus, Tenant, TenantStorageAddon,
    TierChangeHistory, TierChangeStatus,
};
use crate::proration::ProrationResult;

const PENDING_TIER_CHANGE_INDEX: &str = "tier_change_history_one_pending_per_subscription";
const COMPLETED_MIGRATION_INDEX: &str = "pricing_model_migrations_one_completed_per_church";

const TIER_COLUMNS: &str = "id, name, display_name, min_members, max_members, monthly_price, \
     quarterly_price, biannual_price, annual_price, is_active, display_order";

const TENANT_COLUMNS: &str =
    "id, name, email, member_count_cache, eligible_tier_id, tier_checked_at, created_at";

const SUBSCRIPTION_COLUMNS: &str = "id, church_id, tier_id, interval_id, legacy_plan_id, status, \
     trial_ends_at, current_period_start, current_period_end, next_billing_date, amount, \
     auto_renew, grace_period_days, failed_payment_attempts, next_retry_at, \
     free_months_remaining, credit_note, credit_granted_by, credit_granted_at, \
     credit_revoked_reason, card_authorization, pending_tier_id, pending_interval_id, \
     pending_reference, pending_initiated_at, canceled_at, cancel_reason, version, \
     created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, church_id, subscription_id, reference, amount, currency, \
     status, metadata, provider_transaction_id, failure_reason, created_at, verified_at";

const TIER_CHANGE_COLUMNS: &str = "id, church_id, subscription_id, old_tier_id, new_tier_id, \
     old_interval_id, new_interval_id, change_type, proration, old_next_billing_date, \
     new_next_billing_date, payment_reference, status, reason, failure_reason, performed_by, \
     created_at, completed_at";

const MIGRATION_COLUMNS: &str = "id, church_id, subscription_id, old_plan_id, old_plan_name, \
     old_storage_limit_mb, old_monthly_price, previous, new_tier_id, new_member_count, \
     new_monthly_price, status, notes, performed_by, created_at, rolled_back_at, rolled_back_by";

const TENANT_ADDON_COLUMNS: &str = "id, church_id AS tenant_id, subscription_id, addon_id, \
     status, purchase_reference, prorated_amount, renewal_date, activated_at, canceled_at";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    church_id: Uuid,
    tier_id: Option<Uuid>,
    interval_id: Option<Uuid>,
    legacy_plan_id: Option<Uuid>,
    status: SubscriptionStatus,
    trial_ends_at: Option<NaiveDate>,
    current_period_start: NaiveDate,
    current_period_end: NaiveDate,
    next_billing_date: NaiveDate,
    amount: Decimal,
    auto_renew: bool,
    grace_period_days: i32,
    failed_payment_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    free_months_remaining: i32,
    credit_note: Option<String>,
    credit_granted_by: Option<Uuid>,
    credit_granted_at: Option<DateTime<Utc>>,
    credit_revoked_reason: Option<String>,
    card_authorization: Option<Json<StoredAuthorization>>,
    pending_tier_id: Option<Uuid>,
    pending_interval_id: Option<Uuid>,
    pending_reference: Option<String>,
    pending_initiated_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        let pending_upgrade = match (
            row.pending_tier_id,
            row.pending_interval_id,
            row.pending_reference,
            row.pending_initiated_at,
        ) {
            (Some(tier_id), Some(interval_id), Some(reference), Some(initiated_at)) => {
                Some(PendingUpgrade {
                    tier_id,
                    interval_id,
                    reference,
                    initiated_at,
                })
            }
            _ => None,
        };

        Subscription {
            id: row.id,
            tenant_id: row.church_id,
            tier_id: row.tier_id,
            interval_id: row.interval_id,
            legacy_plan_id: row.legacy_plan_id,
            status: row.status,
            trial_ends_at: row.trial_ends_at,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            next_billing_date: row.next_billing_date,
            amount: row.amount,
            auto_renew: row.auto_renew,
            grace_period_days: row.grace_period_days,
            failed_payment_attempts: row.failed_payment_attempts,
            next_retry_at: row.next_retry_at,
            free_months_remaining: row.free_months_remaining,
            credit_note: row.credit_note,
            credit_granted_by: row.credit_granted_by,
            credit_granted_at: row.credit_granted_at,
            credit_revoked_reason: row.credit_revoked_reason,
            authorization: row.card_authorization.map(|Json(a)| a),
            pending_upgrade,
            canceled_at: row.canceled_at,
            cancel_reason: row.cancel_reason,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    church_id: Uuid,
    subscription_id: Option<Uuid>,
    reference: String,
    amount: Decimal,
    currency: String,
    status: PaymentStatus,
    metadata: Json<PaymentMetadata>,
    provider_transaction_id: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            id: row.id,
            tenant_id: row.church_id,
            subscription_id: row.subscription_id,
            reference: row.reference,
            amount: row.amount,
            currency: row.currency,
            status: row.status,
            metadata: row.metadata.0,
            provider_transaction_id: row.provider_transaction_id,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            verified_at: row.verified_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TierChangeRow {
    id: Uuid,
    church_id: Uuid,
    subscription_id: Uuid,
    old_tier_id: Uuid,
    new_tier_id: Uuid,
    old_interval_id: Uuid,
    new_interval_id: Uuid,
    change_type: ChangeType,
    proration: Json<ProrationResult>,
    old_next_billing_date: NaiveDate,
    new_next_billing_date: NaiveDate,
    payment_reference: String,
    status: TierChangeStatus,
    reason: Option<String>,
    failure_reason: Option<String>,
    performed_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TierChangeRow> for TierChangeHistory {
    fn from(row: TierChangeRow) -> Self {
        TierChangeHistory {
            id: row.id,
            tenant_id: row.church_id,
            subscription_id: row.subscription_id,
            old_tier_id: row.old_tier_id,
            new_tier_id: row.new_tier_id,
            old_interval_id: row.old_interval_id,
            new_interval_id: row.new_interval_id,
            change_type: row.change_type,
            proration: row.proration.0,
            old_next_billing_date: row.old_next_billing_date,
            new_next_billing_date: row.new_next_billing_date,
            payment_reference: row.payment_reference,
            status: row.status,
            reason: row.reason,
            failure_reason: row.failure_reason,
            performed_by: row.performed_by,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MigrationRow {
    id: Uuid,
    church_id: Uuid,
    subscription_id: Option<Uuid>,
    old_plan_id: Option<Uuid>,
    old_plan_name: Option<String>,
    old_storage_limit_mb: Option<i64>,
    old_monthly_price: Decimal,
    previous: Option<Json<SubscriptionSnapshot>>,
    new_tier_id: Option<Uuid>,
    new_member_count: i64,
    new_monthly_price: Decimal,
    status: MigrationStatus,
    notes: Option<String>,
    performed_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    rolled_back_at: Option<DateTime<Utc>>,
    rolled_back_by: Option<Uuid>,
}

impl From<MigrationRow> for PricingModelMigration {
    fn from(row: MigrationRow) -> Self {
        PricingModelMigration {
            id: row.id,
            tenant_id: row.church_id,
            subscription_id: row.subscription_id,
            old_plan_id: row.old_plan_id,
            old_plan_name: row.old_plan_name,
            old_storage_limit_mb: row.old_storage_limit_mb,
            old_monthly_price: row.old_monthly_price,
            previous: row.previous.map(|Json(s)| s),
            new_tier_id: row.new_tier_id,
            new_member_count: row.new_member_count,
            new_monthly_price: row.new_monthly_price,
            status: row.status,
            notes: row.notes,
            performed_by: row.performed_by,
            created_at: row.created_at,
            rolled_back_at: row.rolled_back_at,
            rolled_back_by: row.rolled_back_by,
        }
    }
}

/// Map a unique-index violation to a domain error, everything else to `Database`.
fn map_unique_violation(err: sqlx::Error, what: &str) -> BillingError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return match db_err.constraint() {
                Some(PENDING_TIER_CHANGE_INDEX) => BillingError::InvalidState(format!(
                    "{} conflicts with an existing pending tier change",
                    what
                )),
                Some(COMPLETED_MIGRATION_INDEX) => {
                    BillingError::InvalidState(format!("{} conflicts with a completed migration", what))
                }
                _ => BillingError::AlreadyExists(what.to_string()),
            };
        }
    }
    BillingError::from(err)
}

/// Postgres-backed [`BillingStore`]
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_subscription(
        tx: &mut Transaction<'_, Postgres>,
        sub: &Subscription,
    ) -> BillingResult<Subscription> {
        let pending = sub.pending_upgrade.as_ref();
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, church_id, tier_id, interval_id, legacy_plan_id, status,
                trial_ends_at, current_period_start, current_period_end, next_billing_date,
                amount, auto_renew, grace_period_days, failed_payment_attempts, next_retry_at,
                free_months_remaining, credit_note, credit_granted_by, credit_granted_at,
                credit_revoked_reason, card_authorization, pending_tier_id, pending_interval_id,
                pending_reference, pending_initiated_at, canceled_at, cancel_reason, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, 1, NOW(), NOW())
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(sub.id)
        .bind(sub.tenant_id)
        .bind(sub.tier_id)
        .bind(sub.interval_id)
        .bind(sub.legacy_plan_id)
        .bind(sub.status)
        .bind(sub.trial_ends_at)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.next_billing_date)
        .bind(sub.amount)
        .bind(sub.auto_renew)
        .bind(sub.grace_period_days)
        .bind(sub.failed_payment_attempts)
        .bind(sub.next_retry_at)
        .bind(sub.free_months_remaining)
        .bind(&sub.credit_note)
        .bind(sub.credit_granted_by)
        .bind(sub.credit_granted_at)
        .bind(&sub.credit_revoked_reason)
        .bind(sub.authorization.clone().map(Json))
        .bind(pending.map(|p| p.tier_id))
        .bind(pending.map(|p| p.interval_id))
        .bind(pending.map(|p| p.reference.clone()))
        .bind(pending.map(|p| p.initiated_at))
        .bind(sub.canceled_at)
        .bind(&sub.cancel_reason)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_unique_violation(e, &format!("Subscription for church {}", sub.tenant_id)))?;

        Ok(row.into())
    }

    async fn update_subscription(
        tx: &mut Transaction<'_, Postgres>,
        sub: &Subscription,
    ) -> BillingResult<Subscription> {
        // Lock the row and check the optimistic version
        let current: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(sub.id)
                .fetch_optional(&mut **tx)
                .await?;

        let (current_version,) = current
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", sub.id)))?;
        if current_version != sub.version {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} changed (expected version {}, found {})",
                sub.id, sub.version, current_version
            )));
        }

        let pending = sub.pending_upgrade.as_ref();
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                tier_id = $3,
                interval_id = $4,
                legacy_plan_id = $5,
                status = $6,
                trial_ends_at = $7,
                current_period_start = $8,
                current_period_end = $9,
                next_billing_date = $10,
                amount = $11,
                auto_renew = $12,
                grace_period_days = $13,
                failed_payment_attempts = $14,
                next_retry_at = $15,
                free_months_remaining = $16,
                credit_note = $17,
                credit_granted_by = $18,
                credit_granted_at = $19,
                credit_revoked_reason = $20,
                card_authorization = $21,
                pending_tier_id = $22,
                pending_interval_id = $23,
                pending_reference = $24,
                pending_initiated_at = $25,
                canceled_at = $26,
                cancel_reason = $27,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(sub.id)
        .bind(sub.version)
        .bind(sub.tier_id)
        .bind(sub.interval_id)
        .bind(sub.legacy_plan_id)
        .bind(sub.status)
        .bind(sub.trial_ends_at)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.next_billing_date)
        .bind(sub.amount)
        .bind(sub.auto_renew)
        .bind(sub.grace_period_days)
        .bind(sub.failed_payment_attempts)
        .bind(sub.next_retry_at)
        .bind(sub.free_months_remaining)
        .bind(&sub.credit_note)
        .bind(sub.credit_granted_by)
        .bind(sub.credit_granted_at)
        .bind(&sub.credit_revoked_reason)
        .bind(sub.authorization.clone().map(Json))
        .bind(pending.map(|p| p.tier_id))
        .bind(pending.map(|p| p.interval_id))
        .bind(pending.map(|p| p.reference.clone()))
        .bind(pending.map(|p| p.initiated_at))
        .bind(sub.canceled_at)
        .bind(&sub.cancel_reason)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.into())
    }

    async fn update_tenant(tx: &mut Transaction<'_, Postgres>, tenant: &Tenant) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE churches SET
                member_count_cache = $2,
                eligible_tier_id = $3,
                tier_checked_at = $4
            WHERE id = $1
            "#,
        )
        .bind(tenant.id)
        .bind(tenant.member_count_cache)
        .bind(tenant.eligible_tier_id)
        .bind(tenant.tier_checked_at)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Church {}", tenant.id)));
        }
        Ok(())
    }

    async fn write_payment(
        tx: &mut Transaction<'_, Postgres>,
        write: &Write<Payment>,
    ) -> BillingResult<()> {
        match write {
            Write::Insert(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO payments (
                        id, church_id, subscription_id, reference, amount, currency, status,
                        payment_type, metadata, provider_transaction_id, failure_reason,
                        created_at, verified_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    "#,
                )
                .bind(p.id)
                .bind(p.tenant_id)
                .bind(p.subscription_id)
                .bind(&p.reference)
                .bind(p.amount)
                .bind(&p.currency)
                .bind(p.status)
                .bind(p.payment_type())
                .bind(Json(&p.metadata))
                .bind(&p.provider_transaction_id)
                .bind(&p.failure_reason)
                .bind(p.created_at)
                .bind(p.verified_at)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_unique_violation(e, &format!("Payment reference {}", p.reference)))?;
            }
            Write::Update(p) => {
                let current: Option<(PaymentStatus,)> =
                    sqlx::query_as("SELECT status FROM payments WHERE reference = $1 FOR UPDATE")
                        .bind(&p.reference)
                        .fetch_optional(&mut **tx)
                        .await?;
                let (status,) = current
                    .ok_or_else(|| BillingError::NotFound(format!("Payment {}", p.reference)))?;
                if status.is_terminal() && status != p.status {
                    return Err(BillingError::InvalidState(format!(
                        "Payment {} is already {}",
                        p.reference, status
                    )));
                }

                sqlx::query(
                    r#"
                    UPDATE payments SET
                        status = $2,
                        provider_transaction_id = $3,
                        failure_reason = $4,
                        verified_at = $5
                    WHERE reference = $1
                    "#,
                )
                .bind(&p.reference)
                .bind(p.status)
                .bind(&p.provider_transaction_id)
                .bind(&p.failure_reason)
                .bind(p.verified_at)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn write_tier_change(
        tx: &mut Transaction<'_, Postgres>,
        write: &Write<TierChangeHistory>,
    ) -> BillingResult<()> {
        match write {
            Write::Insert(c) => {
                sqlx::query(
                    r#"
                    INSERT INTO tier_change_history (
                        id, church_id, subscription_id, old_tier_id, new_tier_id,
                        old_interval_id, new_interval_id, change_type, proration,
                        old_next_billing_date, new_next_billing_date, payment_reference,
                        status, reason, failure_reason, performed_by, created_at, completed_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                            $16, $17, $18)
                    "#,
                )
                .bind(c.id)
                .bind(c.tenant_id)
                .bind(c.subscription_id)
                .bind(c.old_tier_id)
                .bind(c.new_tier_id)
                .bind(c.old_interval_id)
                .bind(c.new_interval_id)
                .bind(c.change_type)
                .bind(Json(&c.proration))
                .bind(c.old_next_billing_date)
                .bind(c.new_next_billing_date)
                .bind(&c.payment_reference)
                .bind(c.status)
                .bind(&c.reason)
                .bind(&c.failure_reason)
                .bind(c.performed_by)
                .bind(c.created_at)
                .bind(c.completed_at)
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    map_unique_violation(e, &format!("Tier change for payment {}", c.payment_reference))
                })?;
            }
            Write::Update(c) => {
                let current: Option<(TierChangeStatus,)> = sqlx::query_as(
                    "SELECT status FROM tier_change_history WHERE id = $1 FOR UPDATE",
                )
                .bind(c.id)
                .fetch_optional(&mut **tx)
                .await?;
                let (status,) =
                    current.ok_or_else(|| BillingError::NotFound(format!("Tier change {}", c.id)))?;
                if status.is_terminal() {
                    return Err(BillingError::InvalidState(format!(
                        "Tier change {} is already {}",
                        c.id, status
                    )));
                }

                sqlx::query(
                    r#"
                    UPDATE tier_change_history SET
                        status = $2,
                        failure_reason = $3,
                        completed_at = $4
                    WHERE id = $1
                    "#,
                )
                .bind(c.id)
                .bind(c.status)
                .bind(&c.failure_reason)
                .bind(c.completed_at)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn write_migration(
        tx: &mut Transaction<'_, Postgres>,
        write: &Write<PricingModelMigration>,
    ) -> BillingResult<()> {
        match write {
            Write::Insert(m) => {
                sqlx::query(
                    r#"
                    INSERT INTO pricing_model_migrations (
                        id, church_id, subscription_id, old_plan_id, old_plan_name,
                        old_storage_limit_mb, old_monthly_price, previous, new_tier_id,
                        new_member_count, new_monthly_price, status, notes, performed_by,
                        created_at, rolled_back_at, rolled_back_by
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                            $16, $17)
                    "#,
                )
                .bind(m.id)
                .bind(m.tenant_id)
                .bind(m.subscription_id)
                .bind(m.old_plan_id)
                .bind(&m.old_plan_name)
                .bind(m.old_storage_limit_mb)
                .bind(m.old_monthly_price)
                .bind(m.previous.as_ref().map(Json))
                .bind(m.new_tier_id)
                .bind(m.new_member_count)
                .bind(m.new_monthly_price)
                .bind(m.status)
                .bind(&m.notes)
                .bind(m.performed_by)
                .bind(m.created_at)
                .bind(m.rolled_back_at)
                .bind(m.rolled_back_by)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_unique_violation(e, &format!("Migration for church {}", m.tenant_id)))?;
            }
            Write::Update(m) => {
                let result = sqlx::query(
                    r#"
                    UPDATE pricing_model_migrations SET
                        status = $2,
                        notes = $3,
                        rolled_back_at = $4,
                        rolled_back_by = $5
                    WHERE id = $1
                    "#,
                )
                .bind(m.id)
                .bind(m.status)
                .bind(&m.notes)
                .bind(m.rolled_back_at)
                .bind(m.rolled_back_by)
                .execute(&mut **tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(BillingError::NotFound(format!("Pricing migration {}", m.id)));
                }
            }
        }
        Ok(())
    }

    async fn write_addon(
        tx: &mut Transaction<'_, Postgres>,
        write: &Write<TenantStorageAddon>,
    ) -> BillingResult<()> {
        match write {
            Write::Insert(a) => {
                sqlx::query(
                    r#"
                    INSERT INTO church_storage_addons (
                        id, church_id, subscription_id, addon_id, status, purchase_reference,
                        prorated_amount, renewal_date, activated_at, canceled_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(a.id)
                .bind(a.tenant_id)
                .bind(a.subscription_id)
                .bind(a.addon_id)
                .bind(a.status)
                .bind(&a.purchase_reference)
                .bind(a.prorated_amount)
                .bind(a.renewal_date)
                .bind(a.activated_at)
                .bind(a.canceled_at)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_unique_violation(e, &format!("Add-on {}", a.id)))?;
            }
            Write::Update(a) => {
                let result = sqlx::query(
                    r#"
                    UPDATE church_storage_addons SET
                        status = $2,
                        renewal_date = $3,
                        canceled_at = $4
                    WHERE id = $1
                    "#,
                )
                .bind(a.id)
                .bind(a.status)
                .bind(a.renewal_date)
                .bind(a.canceled_at)
                .execute(&mut **tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(BillingError::NotFound(format!("Add-on {}", a.id)));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn list_tiers(&self) -> BillingResult<Vec<PricingTier>> {
        let tiers = sqlx::query_as(&format!(
            "SELECT {} FROM pricing_tiers ORDER BY display_order, min_members",
            TIER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(tiers)
    }

    async fn get_tier(&self, id: Uuid) -> BillingResult<Option<PricingTier>> {
        let tier = sqlx::query_as(&format!("SELECT {} FROM pricing_tiers WHERE id = $1", TIER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tier)
    }

    async fn list_intervals(&self) -> BillingResult<Vec<BillingInterval>> {
        let intervals = sqlx::query_as(
            "SELECT id, name, months, is_active FROM billing_intervals ORDER BY months",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(intervals)
    }

    async fn get_interval(&self, id: Uuid) -> BillingResult<Option<BillingInterval>> {
        let interval =
            sqlx::query_as("SELECT id, name, months, is_active FROM billing_intervals WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(interval)
    }

    async fn get_tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>> {
        let tenant = sqlx::query_as(&format!("SELECT {} FROM churches WHERE id = $1", TENANT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tenant)
    }

    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>> {
        let tenants = sqlx::query_as(&format!(
            "SELECT {} FROM churches ORDER BY created_at, id",
            TENANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }

    async fn get_subscription(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE church_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> BillingResult<Vec<Subscription>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM subscriptions WHERE TRUE",
            SUBSCRIPTION_COLUMNS
        ));

        if !filter.statuses.is_empty() {
            query.push(" AND status IN (");
            let mut statuses = query.separated(", ");
            for status in &filter.statuses {
                statuses.push_bind(*status);
            }
            statuses.push_unseparated(")");
        }
        if let Some(date) = filter.next_billing_on_or_before {
            query.push(" AND next_billing_date <= ").push_bind(date);
        }
        if let Some(auto_renew) = filter.auto_renew {
            query.push(" AND auto_renew = ").push_bind(auto_renew);
        }
        if let Some(at) = filter.retry_due_at_or_before {
            query.push(" AND next_retry_at IS NOT NULL AND next_retry_at <= ").push_bind(at);
        }
        match filter.has_pending_upgrade {
            Some(true) => {
                query.push(" AND pending_reference IS NOT NULL");
            }
            Some(false) => {
                query.push(" AND pending_reference IS NULL");
            }
            None => {}
        }
        query.push(" ORDER BY next_billing_date, id");

        let rows: Vec<SubscriptionRow> = query.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_payment(&self, reference: &str) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE reference = $1",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_tier_change(&self, reference: &str) -> BillingResult<Option<TierChangeHistory>> {
        let row: Option<TierChangeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tier_change_history WHERE payment_reference = $1",
            TIER_CHANGE_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_tier_changes(
        &self,
        tenant_id: Option<Uuid>,
        status: Option<TierChangeStatus>,
    ) -> BillingResult<Vec<TierChangeHistory>> {
        let rows: Vec<TierChangeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM tier_change_history
            WHERE ($1::uuid IS NULL OR church_id = $1)
              AND ($2::varchar IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            "#,
            TIER_CHANGE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_migrations(
        &self,
        tenant_id: Option<Uuid>,
    ) -> BillingResult<Vec<PricingModelMigration>> {
        let rows: Vec<MigrationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM pricing_model_migrations
            WHERE ($1::uuid IS NULL OR church_id = $1)
            ORDER BY created_at DESC, id DESC
            "#,
            MIGRATION_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_legacy_plan(&self, id: Uuid) -> BillingResult<Option<LegacyPlan>> {
        let plan = sqlx::query_as(
            "SELECT id, name, storage_limit_mb, monthly_price FROM legacy_plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn get_addon(&self, id: Uuid) -> BillingResult<Option<StorageAddon>> {
        let addon = sqlx::query_as(
            "SELECT id, name, storage_mb, monthly_price, is_active FROM storage_addons WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(addon)
    }

    async fn list_tenant_addons(
        &self,
        tenant_id: Option<Uuid>,
    ) -> BillingResult<Vec<TenantStorageAddon>> {
        let addons = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM church_storage_addons
            WHERE ($1::uuid IS NULL OR church_id = $1)
            ORDER BY activated_at, id
            "#,
            TENANT_ADDON_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(addons)
    }

    async fn get_tenant_addon(&self, id: Uuid) -> BillingResult<Option<TenantStorageAddon>> {
        let addon = sqlx::query_as(&format!(
            "SELECT {} FROM church_storage_addons WHERE id = $1",
            TENANT_ADDON_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(addon)
    }

    async fn apply(&self, changes: ChangeSet) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        let written = match &changes.subscription {
            Some(Write::Insert(sub)) => Some(Self::insert_subscription(&mut tx, sub).await?),
            Some(Write::Update(sub)) => Some(Self::update_subscription(&mut tx, sub).await?),
            None => None,
        };
        if let Some(tenant) = &changes.tenant {
            Self::update_tenant(&mut tx, tenant).await?;
        }
        for write in &changes.payments {
            Self::write_payment(&mut tx, write).await?;
        }
        for write in &changes.tier_changes {
            Self::write_tier_change(&mut tx, write).await?;
        }
        for write in &changes.migrations {
            Self::write_migration(&mut tx, write).await?;
        }
        for write in &changes.addons {
            Self::write_addon(&mut tx, write).await?;
        }

        if let Some(sub) = &written {
            sqlx::query(
                r#"
                UPDATE church_storage_addons SET renewal_date = $2
                WHERE church_id = $1 AND status = 'ACTIVE' AND renewal_date <> $2
                "#,
            )
            .bind(sub.tenant_id)
            .bind(sub.next_billing_date)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::GROWTH_TIER_ID;

    async fn store() -> PgBillingStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = steward_shared::create_pool(&url, 2)
            .await
            .expect("Failed to create pool");
        steward_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        PgBillingStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_seeded_catalog_is_valid() {
        let store = store().await;
        let catalog = store.catalog().await.unwrap();
        catalog.validate().unwrap();
        assert!(store.get_tier(GROWTH_TIER_ID).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_subscription_version_guard() {
        let store = store().await;
        let church_id = Uuid::new_v4();
        sqlx::query("INSERT INTO churches (id, name, email) VALUES ($1, $2, $3)")
            .bind(church_id)
            .bind("Hope Fellowship")
            .bind("office@hope.example")
            .execute(store.pool())
            .await
            .unwrap();

        let sub = crate::testing::active_subscription(
            church_id,
            GROWTH_TIER_ID,
            crate::catalog::MONTHLY_INTERVAL_ID,
            rust_decimal_macros::dec!(9.99),
        );
        let written = store
            .apply(ChangeSet::new().insert_subscription(sub))
            .await
            .unwrap()
            .unwrap();

        let mut bumped = written.clone();
        bumped.auto_renew = false;
        store
            .apply(ChangeSet::new().update_subscription(bumped))
            .await
            .unwrap();

        let err = store
            .apply(ChangeSet::new().update_subscription(written))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }
}
