//! Trade prints.

use serde::{Deserialize, Serialize};

use super::enums::TradeSide;
use crate::json_util::{de_f64, de_opt_f64, de_opt_u64, de_u64};
use crate::time_util;

/// Trade record as it arrives on the wire (inside `update` frames).
///
/// `ts` is seconds since epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradePayload {
    #[serde(deserialize_with = "de_u64")]
    pub ts: u64,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub slot: Option<u64>,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub base_amount: f64,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub quote_amount: Option<f64>,
    #[serde(default)]
    pub side: Option<TradeSide>,
}

/// A single trade execution, timestamps in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    pub ts_ms: u64,
    /// Upstream sequence (slot) the trade landed in, if known.
    pub slot: Option<u64>,
    pub price: f64,
    pub base_amount: f64,
    pub quote_amount: f64,
    pub side: Option<TradeSide>,
}

impl From<TradePayload> for Trade {
    fn from(p: TradePayload) -> Self {
        Self {
            ts_ms: time_util::secs_to_ms(p.ts),
            slot: p.slot,
            price: p.price,
            base_amount: p.base_amount,
            quote_amount: p.quote_amount.unwrap_or(p.price * p.base_amount),
            side: p.side,
        }
    }
}

impl std::fmt::Display for Trade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match self.side {
            Some(TradeSide::Long) => "LONG",
            Some(TradeSide::Short) => "SHORT",
            None => "?",
        };
        write!(
            f,
            "Trade({side} {:.6}x{:.4} ts={} slot={:?})",
            self.price, self.base_amount, self.ts_ms, self.slot
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_to_trade() {
        let json = r#"{
            "ts": 1700000000, "slot": "250000001", "price": "142.5",
            "baseAmount": 2, "side": "short"
        }"#;
        let payload: TradePayload = serde_json::from_str(json).unwrap();
        let trade = Trade::from(payload);
        assert_eq!(trade.ts_ms, 1_700_000_000_000);
        assert_eq!(trade.slot, Some(250_000_001));
        assert_eq!(trade.quote_amount, 285.0);
        assert_eq!(trade.side, Some(TradeSide::Short));
    }
}
