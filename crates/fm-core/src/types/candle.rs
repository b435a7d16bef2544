//! OHLCV candles.
//!
//! A [`Candle`] is one `(market, resolution, start)` bucket carrying two price
//! series: fill (execution) prices and oracle prices. Candles are immutable
//! once built; every constructor goes through [`Candle::new_at`], which either
//! clamps invalid input ([`ValidationMode::Lenient`], the default) or rejects
//! it ([`ValidationMode::Strict`]).
//!
//! # Timestamp convention
//!
//! `start` is **milliseconds since Unix epoch**, aligned to the resolution's
//! bucket. The wire payload carries seconds; see [`CandlePayload`].

use serde::{Deserialize, Serialize};

use super::resolution::Resolution;
use super::trade::Trade;
use crate::error::{FeedError, Result};
use crate::json_util::{de_f64, de_u64};
use crate::time_util;

// ---------------------------------------------------------------------------
// Ohlc — one price series
// ---------------------------------------------------------------------------

/// Open/high/low/close for one price series.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Ohlc {
    /// A flat series where every field equals `price`.
    #[inline]
    pub const fn flat(price: f64) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    fn is_finite(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
    }

    fn high_floor(&self) -> f64 {
        self.open.max(self.close).max(self.low)
    }

    fn low_ceiling(&self) -> f64 {
        self.open.min(self.close).min(self.high)
    }

    /// Raise `high` / lower `low` until the series is consistent.
    fn clamped(self) -> Self {
        let mut out = self;
        let floor = out.high_floor();
        if out.high < floor {
            out.high = floor;
        }
        let ceiling = out.low_ceiling();
        if out.low > ceiling {
            out.low = ceiling;
        }
        out
    }

    fn check(&self, series: &str) -> Result<()> {
        if !self.is_finite() {
            return Err(FeedError::InvalidCandle(format!(
                "{series} prices must be finite: {self:?}"
            )));
        }
        if self.high < self.high_floor() {
            return Err(FeedError::InvalidCandle(format!(
                "{series} high {} below max(open, close, low) {}",
                self.high,
                self.high_floor()
            )));
        }
        if self.low > self.low_ceiling() {
            return Err(FeedError::InvalidCandle(format!(
                "{series} low {} above min(open, close, high) {}",
                self.low,
                self.low_ceiling()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// How candle construction treats invariant violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Reject with [`FeedError::InvalidCandle`].
    Strict,
    /// Clamp to the nearest valid value.
    #[default]
    Lenient,
}

/// Raw, unchecked candle fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandleProps {
    pub start: u64,
    pub resolution: Resolution,
    pub fill: Ohlc,
    pub oracle: Ohlc,
    pub quote_volume: f64,
    pub base_volume: f64,
}

/// Clamp `props` into a valid candle shape.
///
/// Misaligned starts are floored to their bucket, future buckets are pulled
/// back to the current one, highs/lows are widened to cover open and close,
/// and negative or NaN volumes become zero. Non-finite prices cannot be
/// clamped and still fail.
pub fn get_safe_props(props: CandleProps, now_ms: u64) -> Result<CandleProps> {
    if !props.fill.is_finite() || !props.oracle.is_finite() {
        return Err(FeedError::InvalidCandle(format!("non-finite prices at start {}", props.start)));
    }
    let res = props.resolution;
    let current_bucket = res.bucket_start(now_ms);
    let start = res.bucket_start(props.start).min(current_bucket);

    Ok(CandleProps {
        start,
        resolution: res,
        fill: props.fill.clamped(),
        oracle: props.oracle.clamped(),
        quote_volume: non_negative(props.quote_volume),
        base_volume: non_negative(props.base_volume),
    })
}

/// Verify `props` without modifying them.
pub fn sanity_check_props(props: &CandleProps, now_ms: u64) -> Result<()> {
    let res = props.resolution;
    if !res.is_aligned(props.start) {
        return Err(FeedError::InvalidCandle(format!(
            "start {} not aligned to {}ms buckets",
            props.start,
            res.bucket_ms()
        )));
    }
    if props.start > res.bucket_start(now_ms) {
        return Err(FeedError::InvalidCandle(format!("start {} is a future bucket", props.start)));
    }
    props.fill.check("fill")?;
    props.oracle.check("oracle")?;
    if !(props.quote_volume >= 0.0) || !(props.base_volume >= 0.0) {
        return Err(FeedError::InvalidCandle(format!(
            "negative volume (quote={}, base={})",
            props.quote_volume, props.base_volume
        )));
    }
    Ok(())
}

#[inline]
fn non_negative(v: f64) -> f64 {
    if v >= 0.0 { v } else { 0.0 }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// One validated OHLCV bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub(crate) start: u64,
    pub(crate) resolution: Resolution,
    pub(crate) fill: Ohlc,
    pub(crate) oracle: Ohlc,
    pub(crate) quote_volume: f64,
    pub(crate) base_volume: f64,
}

impl Candle {
    /// Build a candle, validating against the current wall clock.
    pub fn new(props: CandleProps, mode: ValidationMode) -> Result<Self> {
        Self::new_at(props, mode, time_util::now_ms())
    }

    /// Build a candle, validating against `now_ms`.
    pub fn new_at(props: CandleProps, mode: ValidationMode, now_ms: u64) -> Result<Self> {
        let props = match mode {
            ValidationMode::Strict => {
                sanity_check_props(&props, now_ms)?;
                props
            }
            ValidationMode::Lenient => get_safe_props(props, now_ms)?,
        };
        Ok(Self::from_valid(props))
    }

    /// Single-trade candle: every price equals the trade price in both series,
    /// volumes are the trade's size. The trade time is floored to its bucket,
    /// then validated like any other candle against `now_ms`.
    pub fn from_trade(
        trade: &Trade,
        resolution: Resolution,
        mode: ValidationMode,
        now_ms: u64,
    ) -> Result<Self> {
        let flat = Ohlc::flat(trade.price);
        let props = CandleProps {
            start: resolution.bucket_start(trade.ts_ms),
            resolution,
            fill: flat,
            oracle: flat,
            quote_volume: trade.quote_amount,
            base_volume: trade.base_amount,
        };
        Self::new_at(props, mode, now_ms)
    }

    /// Zero-volume placeholder continuing from `previous` into the bucket at
    /// `start`.
    pub fn blank(start: u64, previous: &Candle) -> Self {
        Self {
            start: previous.resolution.bucket_start(start),
            resolution: previous.resolution,
            fill: Ohlc::flat(previous.fill.close),
            oracle: Ohlc::flat(previous.oracle.close),
            quote_volume: 0.0,
            base_volume: 0.0,
        }
    }

    /// Decode a wire/REST payload.
    pub fn from_payload(
        payload: &CandlePayload,
        resolution: Resolution,
        mode: ValidationMode,
    ) -> Result<Self> {
        Self::new(payload.to_props(resolution), mode)
    }

    pub(crate) fn from_valid(props: CandleProps) -> Self {
        Self {
            start: props.start,
            resolution: props.resolution,
            fill: props.fill,
            oracle: props.oracle,
            quote_volume: props.quote_volume,
            base_volume: props.base_volume,
        }
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[inline]
    pub fn fill(&self) -> &Ohlc {
        &self.fill
    }

    #[inline]
    pub fn oracle(&self) -> &Ohlc {
        &self.oracle
    }

    #[inline]
    pub fn quote_volume(&self) -> f64 {
        self.quote_volume
    }

    #[inline]
    pub fn base_volume(&self) -> f64 {
        self.base_volume
    }

    /// Whether no volume traded in this bucket.
    #[inline]
    pub fn is_blank(&self) -> bool {
        self.base_volume == 0.0 && self.quote_volume == 0.0
    }

    pub fn props(&self) -> CandleProps {
        CandleProps {
            start: self.start,
            resolution: self.resolution,
            fill: self.fill,
            oracle: self.oracle,
            quote_volume: self.quote_volume,
            base_volume: self.base_volume,
        }
    }

    /// Encode back into the wire shape (`ts` in seconds).
    pub fn to_payload(&self) -> CandlePayload {
        CandlePayload {
            ts: time_util::ms_to_secs(self.start),
            fill_open: self.fill.open,
            fill_high: self.fill.high,
            fill_low: self.fill.low,
            fill_close: self.fill.close,
            oracle_open: self.oracle.open,
            oracle_high: self.oracle.high,
            oracle_low: self.oracle.low,
            oracle_close: self.oracle.close,
            quote_volume: self.quote_volume,
            base_volume: self.base_volume,
        }
    }
}

impl std::fmt::Display for Candle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Candle({} @{} o={:.6} h={:.6} l={:.6} c={:.6} v={:.4})",
            self.resolution,
            self.start,
            self.fill.open,
            self.fill.high,
            self.fill.low,
            self.fill.close,
            self.base_volume
        )
    }
}

// ---------------------------------------------------------------------------
// Wire payload
// ---------------------------------------------------------------------------

/// Candle as sent by the WebSocket `update` frames and the REST endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandlePayload {
    /// Bucket start, **seconds** since epoch.
    #[serde(deserialize_with = "de_u64")]
    pub ts: u64,
    #[serde(deserialize_with = "de_f64")]
    pub fill_open: f64,
    #[serde(deserialize_with = "de_f64")]
    pub fill_high: f64,
    #[serde(deserialize_with = "de_f64")]
    pub fill_low: f64,
    #[serde(deserialize_with = "de_f64")]
    pub fill_close: f64,
    #[serde(deserialize_with = "de_f64")]
    pub oracle_open: f64,
    #[serde(deserialize_with = "de_f64")]
    pub oracle_high: f64,
    #[serde(deserialize_with = "de_f64")]
    pub oracle_low: f64,
    #[serde(deserialize_with = "de_f64")]
    pub oracle_close: f64,
    #[serde(deserialize_with = "de_f64")]
    pub quote_volume: f64,
    #[serde(deserialize_with = "de_f64")]
    pub base_volume: f64,
}

impl CandlePayload {
    pub fn to_props(&self, resolution: Resolution) -> CandleProps {
        CandleProps {
            start: time_util::secs_to_ms(self.ts),
            resolution,
            fill: Ohlc {
                open: self.fill_open,
                high: self.fill_high,
                low: self.fill_low,
                close: self.fill_close,
            },
            oracle: Ohlc {
                open: self.oracle_open,
                high: self.oracle_high,
                low: self.oracle_low,
                close: self.oracle_close,
            },
            quote_volume: self.quote_volume,
            base_volume: self.base_volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn props(start: u64, fill: Ohlc) -> CandleProps {
        CandleProps {
            start,
            resolution: Resolution::OneMinute,
            fill,
            oracle: Ohlc::flat(6.5),
            quote_volume: 10.0,
            base_volume: 1.0,
        }
    }

    #[test]
    fn lenient_clamps_inverted_range() {
        let bad = Ohlc {
            open: 6.0,
            high: 5.0,
            low: 8.0,
            close: 7.0,
        };
        let c = Candle::new_at(props(60_000, bad), ValidationMode::Lenient, NOW).unwrap();
        let f = c.fill();
        assert!(f.low <= 6.0 && 6.0 <= f.high);
        assert!(f.low <= 7.0 && 7.0 <= f.high);
        assert_eq!(f.high, 8.0);
        assert_eq!(f.low, 6.0);
    }

    #[test]
    fn strict_rejects_inverted_range() {
        let bad = Ohlc {
            open: 6.0,
            high: 5.0,
            low: 8.0,
            close: 7.0,
        };
        let err = Candle::new_at(props(60_000, bad), ValidationMode::Strict, NOW).unwrap_err();
        assert!(matches!(err, FeedError::InvalidCandle(_)));
    }

    #[test]
    fn lenient_zeroes_negative_volume_and_aligns_start() {
        let mut p = props(60_123, Ohlc::flat(1.0));
        p.base_volume = -3.0;
        let c = Candle::new_at(p, ValidationMode::Lenient, NOW).unwrap();
        assert_eq!(c.base_volume(), 0.0);
        assert_eq!(c.start(), 60_000);

        assert!(Candle::new_at(p, ValidationMode::Strict, NOW).is_err());
    }

    #[test]
    fn future_bucket() {
        let p = props(NOW + 120_000, Ohlc::flat(1.0));
        assert!(Candle::new_at(p, ValidationMode::Strict, NOW).is_err());
        let c = Candle::new_at(p, ValidationMode::Lenient, NOW).unwrap();
        assert_eq!(c.start(), Resolution::OneMinute.bucket_start(NOW));
    }

    #[test]
    fn non_finite_prices_fail_in_both_modes() {
        let p = props(60_000, Ohlc::flat(f64::NAN));
        assert!(Candle::new_at(p, ValidationMode::Lenient, NOW).is_err());
        assert!(Candle::new_at(p, ValidationMode::Strict, NOW).is_err());
    }

    #[test]
    fn from_trade_is_flat() {
        let trade = Trade {
            ts_ms: 90_500,
            slot: Some(7),
            price: 101.5,
            base_amount: 2.0,
            quote_amount: 203.0,
            side: None,
        };
        let c = Candle::from_trade(&trade, Resolution::OneMinute, ValidationMode::Strict, NOW)
            .unwrap();
        assert_eq!(c.start(), 60_000);
        assert_eq!(*c.fill(), Ohlc::flat(101.5));
        assert_eq!(*c.oracle(), Ohlc::flat(101.5));
        assert_eq!(c.base_volume(), 2.0);
        assert_eq!(c.quote_volume(), 203.0);
    }

    #[test]
    fn from_trade_is_validated() {
        let trade = |ts_ms: u64, price: f64, base_amount: f64| Trade {
            ts_ms,
            slot: None,
            price,
            base_amount,
            quote_amount: price * base_amount,
            side: None,
        };
        let res = Resolution::OneMinute;
        let current = res.bucket_start(NOW);

        // a trade from the future lands in the current bucket, or is refused
        let ahead = trade(NOW + 30 * 86_400_000, 10.0, 1.0);
        let pulled_back = Candle::from_trade(&ahead, res, ValidationMode::Lenient, NOW).unwrap();
        assert_eq!(pulled_back.start(), current);
        assert!(Candle::from_trade(&ahead, res, ValidationMode::Strict, NOW).is_err());

        let nan = trade(NOW, f64::NAN, 1.0);
        assert!(Candle::from_trade(&nan, res, ValidationMode::Lenient, NOW).is_err());
        assert!(Candle::from_trade(&nan, res, ValidationMode::Strict, NOW).is_err());

        let negative = trade(NOW, 10.0, -2.0);
        assert!(Candle::from_trade(&negative, res, ValidationMode::Strict, NOW).is_err());
        let c = Candle::from_trade(&negative, res, ValidationMode::Lenient, NOW).unwrap();
        assert_eq!(c.base_volume(), 0.0);
        assert_eq!(c.quote_volume(), 0.0);
    }

    #[test]
    fn payload_decodes_seconds() {
        let json = r#"{
            "ts": 1699999980,
            "fillOpen": 10, "fillHigh": "12", "fillLow": 9, "fillClose": 11,
            "oracleOpen": 10.1, "oracleHigh": 12.1, "oracleLow": 9.1, "oracleClose": 11.1,
            "quoteVolume": 1000, "baseVolume": 100
        }"#;
        let payload: CandlePayload = serde_json::from_str(json).unwrap();
        let props = payload.to_props(Resolution::OneMinute);
        let c = Candle::new_at(props, ValidationMode::Strict, NOW).unwrap();
        assert_eq!(c.start(), 1_699_999_980_000);
        assert_eq!(c.fill().high, 12.0);
        assert_eq!(c.to_payload(), payload);
    }
}
