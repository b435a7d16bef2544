//! Candle/trade WebSocket protocol.
//!
//! Outbound: `{"type":"subscribe","symbol":S,"resolution":R}` and the mirrored
//! `unsubscribe`. Inbound frames are JSON objects discriminated by `type`:
//!
//! - `init`, `subscription`, `create` → acknowledgements, ignored downstream
//! - `update` → one candle for `(symbol, resolution)` plus optional trades
//! - `error` → upstream rejected or failed a subscription
//!
//! Anything else decodes as [`InboundFrame::Unknown`].

use fm_core::error::Result;
use fm_core::json_util::de_opt_u64;
use fm_core::types::{Candle, CandlePayload, Resolution, Trade, TradePayload, ValidationMode};
use fm_core::ws::SubscriptionSpec;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::feed::FeedKey;

/// Closed set of inbound frame kinds.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundFrame {
    Init,
    Subscription {
        #[serde(default)]
        symbol: Option<String>,
        #[serde(default)]
        resolution: Option<Resolution>,
    },
    Update(UpdateFrame),
    Create,
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        symbol: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Body of an `update` frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFrame {
    pub symbol: String,
    pub resolution: Resolution,
    /// Upstream sequence (slot) of the update.
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub slot: Option<u64>,
    pub candle: CandlePayload,
    #[serde(default)]
    pub trades: Option<Vec<TradePayload>>,
}

impl UpdateFrame {
    pub fn to_candle(&self, mode: ValidationMode) -> Result<Candle> {
        Candle::from_payload(&self.candle, self.resolution, mode)
    }

    /// Trades in the frame, oldest first.
    pub fn to_trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .trades
            .iter()
            .flatten()
            .cloned()
            .map(Trade::from)
            .collect();
        trades.sort_by_key(|t| (t.ts_ms, t.slot));
        trades
    }
}

/// Decode an already-parsed frame.
pub fn decode(frame: &Value) -> Result<InboundFrame> {
    Ok(InboundFrame::deserialize(frame)?)
}

/// Build the subscribe message for one feed.
pub fn build_subscribe(symbol: &str, resolution: Resolution) -> String {
    control_message("subscribe", symbol, resolution)
}

/// Build the unsubscribe message for one feed.
pub fn build_unsubscribe(symbol: &str, resolution: Resolution) -> String {
    control_message("unsubscribe", symbol, resolution)
}

fn control_message(kind: &str, symbol: &str, resolution: Resolution) -> String {
    json!({ "type": kind, "symbol": symbol, "resolution": resolution.as_wire() }).to_string()
}

/// Resolution field of a frame, string or number.
fn frame_resolution(frame: &Value) -> Option<Resolution> {
    frame.get("resolution").and_then(|v| Resolution::deserialize(v).ok())
}

/// Whether a frame belongs to the feed for `(symbol, resolution)`.
///
/// Frames without a resolution (some error frames) match every feed of the
/// symbol.
pub fn frame_matches(frame: &Value, symbol: &str, resolution: Resolution) -> bool {
    if frame.get("symbol").and_then(Value::as_str) != Some(symbol) {
        return false;
    }
    match frame.get("resolution") {
        None | Some(Value::Null) => true,
        Some(_) => frame_resolution(frame) == Some(resolution),
    }
}

pub fn is_error_frame(frame: &Value) -> bool {
    frame.get("type").and_then(Value::as_str) == Some("error")
}

/// Multiplexer id for a feed. Unique per URL because the URL fixes the env.
pub fn subscription_id(key: &FeedKey) -> String {
    format!("{}:{}", key.market, key.resolution.as_wire())
}

/// Multiplexer registration for one feed.
pub fn subscription_spec(url: &str, key: &FeedKey) -> SubscriptionSpec {
    let symbol = key.market.clone();
    let resolution = key.resolution;
    SubscriptionSpec::new(url, subscription_id(key), build_subscribe(&key.market, resolution))
        .with_unsubscribe(build_unsubscribe(&key.market, resolution))
        .with_message_filter(move |frame| frame_matches(frame, &symbol, resolution))
        .with_error_filter(is_error_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::Env;

    fn update_json() -> Value {
        json!({
            "type": "update",
            "symbol": "SOL-PERP",
            "resolution": "1",
            "slot": "250000001",
            "candle": {
                "ts": 1_700_000_040u64,
                "fillOpen": 10.0, "fillHigh": "12.5", "fillLow": 9.5, "fillClose": 12.0,
                "oracleOpen": 10.1, "oracleHigh": 12.4, "oracleLow": 9.6, "oracleClose": 11.9,
                "quoteVolume": "1200.5", "baseVolume": 100.0
            },
            "trades": [
                {
                    "ts": 1_700_000_050u64, "slot": 250000001u64,
                    "price": "12.0", "baseAmount": 2.0, "side": "long"
                },
                {
                    "ts": 1_700_000_045u64,
                    "price": 11.0, "baseAmount": 1.0, "quoteAmount": 11.0, "side": "sell"
                }
            ]
        })
    }

    #[test]
    fn decodes_update() {
        let InboundFrame::Update(update) = decode(&update_json()).unwrap() else {
            panic!("expected update");
        };
        assert_eq!(update.symbol, "SOL-PERP");
        assert_eq!(update.resolution, Resolution::OneMinute);
        assert_eq!(update.slot, Some(250_000_001));

        let candle = update.to_candle(ValidationMode::Lenient).unwrap();
        assert_eq!(candle.start(), 1_700_000_040_000);
        assert_eq!(candle.fill().high, 12.5);
        assert_eq!(candle.quote_volume(), 1200.5);

        let trades = update.to_trades();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].price, 11.0);
        assert_eq!(trades[1].quote_amount, 24.0);
    }

    #[test]
    fn decodes_control_frames() {
        assert!(matches!(decode(&json!({"type": "init"})).unwrap(), InboundFrame::Init));
        let create = decode(&json!({"type": "create", "x": 1})).unwrap();
        assert!(matches!(create, InboundFrame::Create));
        let ack = json!({"type": "subscription", "symbol": "SOL-PERP", "resolution": "5"});
        match decode(&ack).unwrap() {
            InboundFrame::Subscription { symbol, resolution } => {
                assert_eq!(symbol.as_deref(), Some("SOL-PERP"));
                assert_eq!(resolution, Some(Resolution::FiveMinutes));
            }
            other => panic!("unexpected {other:?}"),
        }
        let error = json!({"type": "error", "message": "unknown market", "symbol": "X"});
        match decode(&error).unwrap() {
            InboundFrame::Error { message, .. } => {
                assert_eq!(message.as_deref(), Some("unknown market"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(decode(&json!({"type": "heartbeat"})).unwrap(), InboundFrame::Unknown));
    }

    #[test]
    fn malformed_update_is_an_error() {
        let frame = json!({"type": "update", "symbol": "SOL-PERP", "resolution": "1"});
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn filter_matches_symbol_and_resolution() {
        let frame = update_json();
        assert!(frame_matches(&frame, "SOL-PERP", Resolution::OneMinute));
        assert!(!frame_matches(&frame, "SOL-PERP", Resolution::FiveMinutes));
        assert!(!frame_matches(&frame, "BTC-PERP", Resolution::OneMinute));

        let numeric = json!({"type": "update", "symbol": "SOL-PERP", "resolution": 60});
        assert!(frame_matches(&numeric, "SOL-PERP", Resolution::OneHour));

        let err = json!({"type": "error", "symbol": "SOL-PERP", "message": "boom"});
        assert!(frame_matches(&err, "SOL-PERP", Resolution::FiveMinutes));
        assert!(is_error_frame(&err));
        assert!(!is_error_frame(&frame));
    }

    #[test]
    fn subscribe_messages() {
        let text = build_subscribe("SOL-PERP", Resolution::OneDay);
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, json!({"type": "subscribe", "symbol": "SOL-PERP", "resolution": "D"}));
        let text = build_unsubscribe("SOL-PERP", Resolution::OneMinute);
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "unsubscribe");

        let key = FeedKey::new(Env::Mainnet, "SOL-PERP", Resolution::FifteenMinutes);
        assert_eq!(subscription_id(&key), "SOL-PERP:15");
    }
}
