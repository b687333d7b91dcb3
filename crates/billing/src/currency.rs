//! Currency precision and rounding of prorated amounts

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, BillingResult};

/// ISO-4217 minor unit digits for the currencies we bill in
const MINOR_UNITS: &[(&str, u32)] = &[
    ("AUD", 2),
    ("BHD", 3),
    ("BRL", 2),
    ("CAD", 2),
    ("CHF", 2),
    ("CLP", 0),
    ("CNY", 2),
    ("CZK", 2),
    ("DKK", 2),
    ("EUR", 2),
    ("GBP", 2),
    ("HUF", 2),
    ("INR", 2),
    ("ISK", 0),
    ("JPY", 0),
    ("KRW", 0),
    ("KWD", 3),
    ("MXN", 2),
    ("NOK", 2),
    ("NZD", 2),
    ("PLN", 2),
    ("SEK", 2),
    ("SGD", 2),
    ("USD", 2),
    ("ZAR", 2),
];

/// Rounds amounts to the precision of one currency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyCalculator {
    code: String,
    precision: u32,
}

impl CurrencyCalculator {
    /// Resolve the calculator for an ISO-4217 code (case-insensitive)
    pub fn for_code(code: &str) -> BillingResult<Self> {
        let upper = code.trim().to_ascii_uppercase();
        MINOR_UNITS
            .iter()
            .find(|(c, _)| *c == upper)
            .map(|(c, precision)| Self {
                code: (*c).to_string(),
                precision: *precision,
            })
            .ok_or_else(|| BillingError::UnknownCurrency(code.to_string()))
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn round(&self, amount: Decimal) -> Decimal {
        amount
            .round_dp_with_strategy(self.precision, RoundingStrategy::MidpointAwayFromZero)
            .normalize()
    }
}
