//! Typed error definitions for the feed multiplexer.
//!
//! Provides [`FeedError`] for every failure the core can surface. All variants
//! implement `std::error::Error` via `thiserror`, so they integrate with
//! `anyhow::Result` in the runner.
//!
//! Sequence regressions are deliberately absent: a stale update is not an
//! error, it is reported as `false` from
//! [`SequenceGuard::accept`](crate::sequence::SequenceGuard::accept).

use thiserror::Error;
use uuid::Uuid;

/// Domain-specific errors for the feed multiplexer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// WebSocket connection, handshake, or communication error.
    ///
    /// Recovered automatically by reconnecting; subscribers only see it as an
    /// error event on their stream.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Reconnect budget for one connection was used up inside the window.
    #[error("reconnect attempts exhausted for {url} ({attempts} attempts)")]
    ReconnectExhausted { url: String, attempts: u32 },

    /// An inbound frame could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// The upstream sent an explicit error frame for a subscription.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A subscription id is already registered on the same URL.
    #[error("subscription {id} already registered on {url}")]
    DuplicateSubscription { url: String, id: String },

    /// `unsubscribe` was called with an id the broker does not know.
    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(Uuid),

    /// A subscribe request is malformed (e.g. candles without a resolution).
    #[error("invalid subscription request: {0}")]
    InvalidRequest(String),

    /// Candle violates an OHLCV invariant (strict validation only).
    #[error("invalid candle: {0}")]
    InvalidCandle(String),

    /// The historical REST endpoint failed or answered `success: false`.
    #[error("history error: {0}")]
    History(String),

    /// The multiplexer or broker was already shut down.
    #[error("shut down")]
    Shutdown,
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Convenience alias used across the core crates.
pub type Result<T> = std::result::Result<T, FeedError>;
