//! Money rounding and currency conversion

use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places kept on money amounts
pub const MONEY_SCALE: u32 = 2;
/// Decimal places kept on daily rates
pub const RATE_SCALE: u32 = 4;

/// Round a money amount half-up to 2 decimal places.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a daily rate half-up to 4 decimal places.
pub fn round_rate(rate: Decimal) -> Decimal {
    rate.round_dp_with_strategy(RATE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts base-currency (USD) amounts into the currency tenants pay in.
pub trait CurrencyConverter: Send + Sync {
    /// ISO code of the payment currency
    fn payment_currency(&self) -> &str;

    /// Convert a USD amount. Implementations must be deterministic for a given rate.
    fn usd_to_local(&self, amount_usd: Decimal) -> Decimal;
}

/// Converter with a single configured exchange rate
#[derive(Debug, Clone)]
pub struct FixedRateConverter {
    currency: String,
    rate: Decimal,
}

impl FixedRateConverter {
    pub fn new(currency: impl Into<String>, rate: Decimal) -> Self {
        Self {
            currency: currency.into(),
            rate,
        }
    }

    pub fn rate(&self) -> Decimal {
        self.rate
    }
}

impl CurrencyConverter for FixedRateConverter {
    fn payment_currency(&self) -> &str {
        &self.currency
    }

    fn usd_to_local(&self, amount_usd: Decimal) -> Decimal {
        round_money(amount_usd * self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_money_half_up() {
        assert_eq!(round_money(dec!(4.995)), dec!(5.00));
        assert_eq!(round_money(dec!(4.994)), dec!(4.99));
        assert_eq!(round_money(dec!(-0.005)), dec!(-0.01));
    }

    #[test]
    fn test_round_rate() {
        assert_eq!(round_rate(dec!(9.99) / dec!(30)), dec!(0.3330));
        assert_eq!(round_rate(dec!(13.99) / dec!(30)), dec!(0.4663));
    }

    #[test]
    fn test_fixed_rate_conversion() {
        let converter = FixedRateConverter::new("NGN", dec!(1500));
        assert_eq!(converter.payment_currency(), "NGN");
        assert_eq!(converter.usd_to_local(dec!(2.00)), dec!(3000.00));
        assert_eq!(converter.usd_to_local(dec!(0.333)), dec!(499.50));
    }
}
