use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::money;

pub const KEY_SCHEME: &str = "sha256:p:";

/// Hex characters kept from the digest (128 bits).
const KEY_HEX_LEN: usize = 32;

/// Derives the stable key for allocating `amount` of a payment to an invoice.
///
/// The amount is normalised to six fractional digits first, so values that
/// only differ in representation or trailing float noise map to the same key.
pub fn derive_key(payment_id: i64, invoice_id: i64, amount: Decimal) -> Result<String> {
    let micros = money::to_micros(amount)?;
    let base = format!("{payment_id}|{invoice_id}|{}", money::from_micros(micros));
    let digest = Sha256::digest(base.as_bytes());
    let mut key = String::with_capacity(KEY_SCHEME.len() + KEY_HEX_LEN);
    key.push_str(KEY_SCHEME);
    key.push_str(&hex::encode(digest)[..KEY_HEX_LEN]);
    Ok(key)
}

pub fn derive_key_f64(payment_id: i64, invoice_id: i64, amount: f64) -> Result<String> {
    derive_key(payment_id, invoice_id, money::from_f64(amount)?)
}
