//! Lenient JSON number helpers shared by the wire payload types.
//!
//! The candle and trade endpoints usually send JSON numbers, but some
//! deployments encode prices and sizes as strings (`"142.5"`). The serde
//! adapters here accept both.

use serde::{Deserialize, Deserializer};

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&serde_json::Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn parse_str_u64(v: Option<&serde_json::Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    }
}

/// `#[serde(deserialize_with)]` adapter: number or numeric string → `f64`.
pub fn de_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    parse_str_f64(Some(&v))
        .ok_or_else(|| serde::de::Error::custom(format!("expected number, got {v}")))
}

/// Optional variant of [`de_f64`]; `null` maps to `None`.
pub fn de_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    if v.is_null() {
        return Ok(None);
    }
    parse_str_f64(Some(&v))
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("expected number, got {v}")))
}

/// `#[serde(deserialize_with)]` adapter: number or numeric string → `u64`.
pub fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    parse_str_u64(Some(&v))
        .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {v}")))
}

/// Optional variant of [`de_u64`]; `null` maps to `None`.
pub fn de_opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    if v.is_null() {
        return Ok(None);
    }
    parse_str_u64(Some(&v))
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {v}")))
}
