//! Steward Billing Worker
//!
//! Handles scheduled billing jobs:
//! - Subscription renewals (daily at 01:00 UTC)
//! - Past-due suspension after the grace period (daily at 01:30 UTC)
//! - Recurring charge retries on stored cards (hourly)
//! - Stale pending upgrade reconciliation (every 15 minutes)
//! - Billing invariant checks (daily at 05:00 UTC)
//!
//! Every schedule can be overridden with a six-field cron expression in the
//! matching `*_CRON` environment variable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use steward_billing::{
    BillingConfig, BillingService, BillingStore, MemberDirectory, PaymentProvider,
    PgBillingStore, PgMemberDirectory, UnconfiguredPaymentProvider,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

const DB_CONNECT_ATTEMPTS: usize = 5;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Create a database connection pool, retrying while the database comes up
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections: u32 = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    let strategy = ExponentialBackoff::from_millis(500)
        .max_delay(Duration::from_secs(10))
        .take(DB_CONNECT_ATTEMPTS)
        .map(jitter);

    let pool = Retry::spawn(strategy, || async {
        steward_shared::create_pool(&database_url, max_connections)
            .await
            .inspect_err(|e| warn!(error = %e, "Database not reachable yet, retrying"))
    })
    .await
    .context("Failed to connect to database")?;

    info!(max_connections = max_connections, "Database pool created");
    Ok(pool)
}

fn cron_from_env(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before reading RUST_LOG / LOG_FORMAT
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Steward billing worker");

    let pool = create_db_pool().await?;
    {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let migration_pool = steward_shared::create_migration_pool(&database_url)
            .await
            .context("Failed to open migration connection")?;
        steward_shared::run_migrations(&migration_pool)
            .await
            .context("Failed to run database migrations")?;
        migration_pool.close().await;
    }
    info!("Database migrations applied");

    let config = BillingConfig::from_env()?;
    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
    store.catalog().await?.validate()?;

    let members: Arc<dyn MemberDirectory> = Arc::new(PgMemberDirectory::new(pool));
    // No provider integration is wired into the worker yet, so card retries and
    // upgrade reconciliation stay off until one is.
    let provider: Arc<dyn PaymentProvider> = Arc::new(UnconfiguredPaymentProvider);
    let provider_configured = provider.is_configured();
    let billing = Arc::new(BillingService::new(
        store,
        members,
        provider,
        config.clone(),
    ));

    let scheduler = JobScheduler::new().await?;
    let mut scheduled = 0;

    // Job 1: Renewals
    let renewal_cron = cron_from_env("RENEWAL_CRON", "0 0 1 * * *");
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async(renewal_cron.as_str(), move |_uuid, _l| {
            let billing = renewal_billing.clone();
            Box::pin(async move {
                info!("Running subscription renewal sweep");
                match billing.subscriptions.process_renewals().await {
                    Ok(report) => {
                        for failure in &report.failures {
                            error!(
                                tenant_id = %failure.tenant_id,
                                kind = failure.kind,
                                error = %failure.error,
                                "Renewal failed"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Renewal sweep aborted"),
                }
            })
        })?)
        .await?;
    scheduled += 1;
    info!(cron = %renewal_cron, "Scheduled: Subscription renewals");

    // Job 2: Suspension after grace period
    let suspension_cron = cron_from_env("SUSPENSION_CRON", "0 30 1 * * *");
    let suspension_billing = billing.clone();
    scheduler
        .add(Job::new_async(suspension_cron.as_str(), move |_uuid, _l| {
            let billing = suspension_billing.clone();
            Box::pin(async move {
                info!("Running past-due suspension sweep");
                if let Err(e) = billing.subscriptions.suspend_past_due().await {
                    error!(error = %e, "Suspension sweep aborted");
                }
            })
        })?)
        .await?;
    scheduled += 1;
    info!(cron = %suspension_cron, "Scheduled: Past-due suspension");

    if provider_configured {
        // Job 3: Recurring charge retries
        let retry_cron = cron_from_env("RETRY_CRON", "0 0 * * * *");
        let retry_billing = billing.clone();
        scheduler
            .add(Job::new_async(retry_cron.as_str(), move |_uuid, _l| {
                let billing = retry_billing.clone();
                Box::pin(async move {
                    info!("Running recurring charge retries");
                    if let Err(e) = billing.subscriptions.retry_due_charges().await {
                        error!(error = %e, "Recurring charge retry sweep aborted");
                    }
                })
            })?)
            .await?;
        scheduled += 1;
        info!(cron = %retry_cron, "Scheduled: Recurring charge retries");

        // Job 4: Stale upgrade reconciliation
        let reconcile_cron = cron_from_env("RECONCILE_CRON", "0 */15 * * * *");
        let reconcile_billing = billing.clone();
        let timeout = config.pending_upgrade_timeout;
        scheduler
            .add(Job::new_async(reconcile_cron.as_str(), move |_uuid, _l| {
                let billing = reconcile_billing.clone();
                Box::pin(async move {
                    if let Err(e) = billing
                        .upgrades
                        .reconcile_stale_pending_upgrades(timeout)
                        .await
                    {
                        error!(error = %e, "Stale upgrade reconciliation aborted");
                    }
                })
            })?)
            .await?;
        scheduled += 1;
        info!(cron = %reconcile_cron, "Scheduled: Stale upgrade reconciliation");
    } else {
        warn!("Payment provider not configured - recurring charge retries and upgrade reconciliation disabled");
    }

    // Job 5: Invariant checks
    let invariants_cron = cron_from_env("INVARIANTS_CRON", "0 0 5 * * *");
    let invariants_billing = billing.clone();
    scheduler
        .add(Job::new_async(invariants_cron.as_str(), move |_uuid, _l| {
            let billing = invariants_billing.clone();
            Box::pin(async move {
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Billing invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                tenant_ids = ?violation.tenant_ids,
                                "{}",
                                violation.description
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    scheduled += 1;
    info!(cron = %invariants_cron, "Scheduled: Billing invariant checks");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        jobs = scheduled,
        "Steward billing worker started successfully"
    );

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
