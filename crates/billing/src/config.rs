//! Billing configuration
//!
//! All knobs are read from the environment with sensible defaults so the
//! engine runs locally without any configuration at all.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{BillingError, BillingResult};

/// Backoff schedule for recurring charges against a stored authorization.
///
/// The delay doubles with every failed attempt and is capped at `max_delay`.
/// Once `max_attempts` failures have been recorded no further retry is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const MULTIPLIER: u32 = 2;

    /// Delay before retry number `attempt` (1-based). `None` when the ceiling is reached.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = Self::MULTIPLIER.saturating_pow(attempt - 1);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    /// Convenience wrapper returning a chrono duration for timestamp arithmetic.
    pub fn chrono_delay_for(&self, attempt: u32) -> Option<chrono::Duration> {
        self.delay_for(attempt)
            .and_then(|d| chrono::Duration::from_std(d).ok())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(24 * 3600),
            max_delay: Duration::from_secs(168 * 3600),
            max_attempts: 4,
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Trial length for newly created subscriptions
    pub trial_days: i64,
    /// Days a PAST_DUE subscription keeps access before suspension
    pub grace_period_days: i32,
    /// Member usage (percent of tier max) above which an upgrade is required
    pub upgrade_threshold_percent: Decimal,
    /// Currency every provider charge is made in
    pub payment_currency: String,
    /// Local currency units per USD
    pub usd_exchange_rate: Decimal,
    /// Redirect target handed to the payment provider
    pub callback_url: String,
    pub retry: RetryPolicy,
    /// Age after which a PENDING upgrade is reconciled
    pub pending_upgrade_timeout: chrono::Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            trial_days: 30,
            grace_period_days: 7,
            upgrade_threshold_percent: dec!(95),
            payment_currency: "NGN".to_string(),
            usd_exchange_rate: dec!(1500),
            callback_url: "http://localhost:3000/billing/callback".to_string(),
            retry: RetryPolicy::default(),
            pending_upgrade_timeout: chrono::Duration::minutes(60),
        }
    }
}

impl BillingConfig {
    /// Build the configuration from `BILLING_*` environment variables.
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let initial_hours: u64 = env_or("BILLING_RETRY_INITIAL_DELAY_HOURS", 24)?;
        let max_hours: u64 = env_or("BILLING_RETRY_MAX_DELAY_HOURS", 168)?;
        if initial_hours > max_hours {
            return Err(BillingError::Configuration(format!(
                "BILLING_RETRY_INITIAL_DELAY_HOURS ({}) exceeds BILLING_RETRY_MAX_DELAY_HOURS ({})",
                initial_hours, max_hours
            )));
        }

        let usd_exchange_rate: Decimal =
            env_or("BILLING_USD_EXCHANGE_RATE", defaults.usd_exchange_rate)?;
        if usd_exchange_rate <= Decimal::ZERO {
            return Err(BillingError::Configuration(
                "BILLING_USD_EXCHANGE_RATE must be positive".to_string(),
            ));
        }

        let upgrade_threshold_percent: Decimal = env_or(
            "BILLING_UPGRADE_THRESHOLD_PERCENT",
            defaults.upgrade_threshold_percent,
        )?;
        if upgrade_threshold_percent <= Decimal::ZERO || upgrade_threshold_percent > dec!(100) {
            return Err(BillingError::Configuration(
                "BILLING_UPGRADE_THRESHOLD_PERCENT must be in (0, 100]".to_string(),
            ));
        }

        let timeout_minutes: i64 = env_or("BILLING_PENDING_UPGRADE_TIMEOUT_MINUTES", 60)?;

        Ok(Self {
            trial_days: env_or("BILLING_TRIAL_DAYS", defaults.trial_days)?,
            grace_period_days: env_or("BILLING_GRACE_PERIOD_DAYS", defaults.grace_period_days)?,
            upgrade_threshold_percent,
            payment_currency: std::env::var("BILLING_PAYMENT_CURRENCY")
                .unwrap_or(defaults.payment_currency)
                .to_uppercase(),
            usd_exchange_rate,
            callback_url: std::env::var("BILLING_CALLBACK_URL").unwrap_or(defaults.callback_url),
            retry: RetryPolicy {
                initial_delay: Duration::from_secs(initial_hours * 3600),
                max_delay: Duration::from_secs(max_hours * 3600),
                max_attempts: env_or("BILLING_RETRY_MAX_ATTEMPTS", 4)?,
            },
            pending_upgrade_timeout: chrono::Duration::minutes(timeout_minutes.max(1)),
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Configuration(format!("{} has invalid value '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_until_capped() {
        let policy = RetryPolicy::default();
        let hours = |attempt| policy.delay_for(attempt).map(|d| d.as_secs() / 3600);

        assert_eq!(hours(1), Some(24));
        assert_eq!(hours(2), Some(48));
        assert_eq!(hours(3), Some(96));
        assert_eq!(hours(4), Some(168)); // 192 capped
        assert_eq!(hours(5), None);
        assert_eq!(hours(0), None);
    }

    #[test]
    fn test_retry_delay_survives_overflow() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(7200),
            max_attempts: 200,
        };
        assert_eq!(policy.delay_for(150), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.trial_days, 30);
        assert_eq!(config.grace_period_days, 7);
        assert_eq!(config.payment_currency, "NGN");
        assert_eq!(config.pending_upgrade_timeout, chrono::Duration::minutes(60));
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("BILLING_TEST_ENV_OR_GARBAGE", "abc");
        let parsed: BillingResult<i64> = env_or("BILLING_TEST_ENV_OR_GARBAGE", 3);
        assert!(matches!(parsed, Err(BillingError::Configuration(_))));
        std::env::remove_var("BILLING_TEST_ENV_OR_GARBAGE");

        let missing: i64 = env_or("BILLING_TEST_ENV_OR_MISSING", 3).unwrap();
        assert_eq!(missing, 3);
    }
}
