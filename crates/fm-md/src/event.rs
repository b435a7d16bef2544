//! Events delivered to broker subscribers.

use std::sync::Arc;
use std::time::Duration;

use fm_core::types::{Candle, Env, Trade};

/// One decoded candle update.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleUpdate {
    pub env: Env,
    pub market: String,
    pub candle: Candle,
    /// Upstream sequence of the frame, if stamped.
    pub slot: Option<u64>,
    /// Local epoch ms when the frame was read off the socket.
    pub received_at_ms: u64,
}

/// Trades bundled with one update frame, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeBatch {
    pub env: Env,
    pub market: String,
    pub trades: Vec<Trade>,
    pub slot: Option<u64>,
    pub received_at_ms: u64,
}

/// Feed health as a consumer should present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// Transport dropped; data resumes after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Upstream subscription was recreated. Sequence numbers restart, so
    /// consumers reset their guards.
    Resubscribed,
    /// Recoverable problem (bad frame, upstream error, invalid candle).
    Error(String),
    /// Reconnect budget exhausted; the feed is down until refreshed.
    Unavailable(String),
    /// Connection closed and not reconnecting on its own.
    Closed,
}

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Candle(CandleUpdate),
    Trades(Arc<TradeBatch>),
    Status(FeedStatus),
}
