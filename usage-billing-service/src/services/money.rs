//! Currency precision and rounding.

use crate::error::BillingError;
use rust_decimal::{Decimal, RoundingStrategy};

/// ISO 4217 minor-unit exponent for `currency`. Unlisted codes use 2.
pub fn minor_units(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "UYI" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        "CLF" | "UYW" => 4,
        _ => 2,
    }
}

/// Round once to the currency's minor units, half away from zero.
///
/// The result always carries exactly the currency's scale, so `1.5` in USD
/// renders as `1.50`.
pub fn round_money(amount: Decimal, currency: &str) -> Decimal {
    let dp = minor_units(currency);
    let mut rounded = amount.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(dp);
    rounded
}

fn overflow(a: Decimal, op: char, b: Decimal) -> BillingError {
    tracing::error!(lhs = %a, rhs = %b, op = %op, "Decimal overflow in billing arithmetic");
    BillingError::ConsistencyViolation(format!("amount overflow computing {} {} {}", a, op, b))
}

/// `a × b`, failing instead of panicking when the result does not fit.
pub fn checked_mul(a: Decimal, b: Decimal) -> Result<Decimal, BillingError> {
    a.checked_mul(b).ok_or_else(|| overflow(a, '*', b))
}

pub fn checked_add(a: Decimal, b: Decimal) -> Result<Decimal, BillingError> {
    a.checked_add(b).ok_or_else(|| overflow(a, '+', b))
}

pub fn checked_sub(a: Decimal, b: Decimal) -> Result<Decimal, BillingError> {
    a.checked_sub(b).ok_or_else(|| overflow(a, '-', b))
}

/// Sum of `amounts` with overflow reported as an error.
pub fn checked_sum<I>(amounts: I) -> Result<Decimal, BillingError>
where
    I: IntoIterator<Item = Decimal>,
{
    amounts
        .into_iter()
        .try_fold(Decimal::ZERO, checked_add)
}

/// Whether `currency` looks like an ISO 4217 alphabetic code.
pub fn is_currency_code(currency: &str) -> bool {
    currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase())
}
