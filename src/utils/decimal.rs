//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Parse an exchange rate string such as `"0.0100%"` into a fraction.
///
/// A trailing percent sign means the value is a percentage and is divided by
/// 100; a bare number is taken to already be a fraction.
pub fn parse_rate(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    match trimmed.strip_suffix('%') {
        Some(pct) => pct.trim().parse::<Decimal>().ok().map(|v| v / dec!(100)),
        None => trimmed.parse::<Decimal>().ok(),
    }
}

/// Express a fraction as a percentage.
pub fn to_pct(rate: Decimal) -> Decimal {
    rate * dec!(100)
}

/// Calculate basis points (1 bp = 0.01%)
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Division that yields `None` when the divisor is zero.
pub fn checked_ratio(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator == Decimal::ZERO {
        None
    } else {
        numerator.checked_div(denominator)
    }
}

/// Lossy conversion for statistics that need floating point (sqrt, powf).
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Convert back from floating point; NaN and infinities map to `None`.
pub fn from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value).map(|d| d.round_dp(12))
}
