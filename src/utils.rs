use bigdecimal::BigDecimal;
use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::errors::{Error, Result};

/// floor(a * b / c) without intermediate overflow.
pub fn mul_div_floor(a: u128, b: u128, c: u128) -> Result<u128> {
  if c == 0 {
    return Err(Error::Invariant("division by zero weight".to_owned()))
  }
  if let Some(product) = a.checked_mul(b) {
    return Ok(product / c)
  }
  let wide = BigUint::from(a) * BigUint::from(b) / BigUint::from(c);
  wide.to_u128().ok_or_else(|| Error::Invariant(format!("{} * {} / {} overflows u128", a, b, c)))
}

pub fn checked_sum<I: IntoIterator<Item = u128>>(values: I) -> Result<u128> {
  values.into_iter().try_fold(0u128, |acc, v| {
    acc.checked_add(v).ok_or_else(|| Error::Invariant("sum overflows u128".to_owned()))
  })
}

/// Numeric column to amount. Rejects fractional and negative values.
pub fn to_u128(bd: &BigDecimal) -> Result<u128> {
  let (bigint, exponent) = bd.normalized().as_bigint_and_exponent();
  if exponent > 0 {
    return Err(Error::Storage(format!("non-integer amount {}", bd)))
  }
  let scaled = bigint * num_bigint::BigInt::from(10u8).pow((-exponent) as u32);
  scaled.to_u128().ok_or_else(|| Error::Storage(format!("amount {} out of range", bd)))
}

pub fn from_u128(amount: u128) -> BigDecimal {
  BigDecimal::from(num_bigint::BigInt::from(amount))
}

pub fn encode_hash(hash: &[u8; 32]) -> String {
  format!("0x{}", hex::encode(hash))
}

pub fn decode_hash(s: &str) -> Result<[u8; 32]> {
  let bytes = hex::decode(s.trim_start_matches("0x"))
    .map_err(|e| Error::Storage(format!("invalid hash {}: {}", s, e)))?;
  let mut out = [0u8; 32];
  if bytes.len() != 32 {
    return Err(Error::Storage(format!("invalid hash length {}", s)))
  }
  out.copy_from_slice(&bytes);
  Ok(out)
}

/// Parses a 20-byte hex address.
pub fn address_bytes(address: &str) -> Option<[u8; 20]> {
  let stripped = address.strip_prefix("0x")?;
  let bytes = hex::decode(stripped).ok()?;
  if bytes.len() != 20 {
    return None
  }
  let mut out = [0u8; 20];
  out.copy_from_slice(&bytes);
  Some(out)
}

/// Canonical lowercase form; `None` if not a 20-byte hex address.
pub fn normalize_address(address: &str) -> Option<String> {
  address_bytes(&address.to_lowercase()).map(|b| format!("0x{}", hex::encode(b)))
}

/// Parses a `0x`-prefixed hex quantity as returned by JSON-RPC.
pub fn parse_quantity(s: &str) -> Option<u64> {
  u64::from_str_radix(s.strip_prefix("0x")?, 16).ok()
}

/// Serde adapter for amounts carried as decimal strings in json.
pub mod u128_string {
  use serde::{de, Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&v.to_string())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
    let s = String::deserialize(d)?;
    s.parse::<u128>().map_err(de::Error::custom)
  }
}
