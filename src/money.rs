//! Exact currency amounts.
//!
//! Amounts travel through the crate as [`Decimal`] and are stored as INTEGER
//! micro-units, so every amount is normalised to [`SCALE`] fractional digits
//! before it is compared, hashed or written.

use std::str::FromStr;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{AppError, Result};

pub const SCALE: u32 = 6;

pub fn normalize(amount: Decimal) -> Decimal {
    let mut value = amount.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
    value.rescale(SCALE);
    value
}

pub fn to_micros(amount: Decimal) -> Result<i64> {
    let value = normalize(amount);
    i64::try_from(value.mantissa())
        .map_err(|_| AppError::Validation(format!("amount {amount} is out of range")))
}

pub fn from_micros(micros: i64) -> Decimal {
    Decimal::new(micros, SCALE)
}

pub fn from_f64(value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(AppError::Validation(format!("amount {value} is not a finite number")));
    }
    Decimal::from_f64(value)
        .map(normalize)
        .ok_or_else(|| AppError::Validation(format!("amount {value} is out of range")))
}

/// Parses user-entered amounts, accepting Persian and Arabic-Indic digits and
/// thousands separators.
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' ' | '\u{066C}'))
        .map(|c| match c {
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{066B}' => '.',
            other => other,
        })
        .collect();
    if cleaned.is_empty() {
        return Err(AppError::Validation("amount is empty".into()));
    }
    Decimal::from_str(&cleaned)
        .map(normalize)
        .map_err(|e| AppError::Validation(format!("invalid amount '{raw}': {e}")))
}
