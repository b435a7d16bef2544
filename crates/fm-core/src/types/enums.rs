//! Enumerations shared by the multiplexer, the broker and the consumers.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// Venue environment. Each environment has its own data endpoint, so feeds in
/// different environments never share a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    #[default]
    Mainnet,
    Devnet,
}

impl std::fmt::Display for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Devnet => write!(f, "devnet"),
        }
    }
}

impl std::str::FromStr for Env {
    type Err = crate::error::FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "mainnet-beta" => Ok(Self::Mainnet),
            "devnet" => Ok(Self::Devnet),
            other => Err(crate::error::FeedError::Config(format!("unknown env: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription kinds
// ---------------------------------------------------------------------------

/// What a logical subscriber wants out of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    /// Candle updates for one `(market, resolution)`.
    Candles,
    /// Trade prints for one market, any resolution.
    Trades,
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candles => write!(f, "candles"),
            Self::Trades => write!(f, "trades"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Explicit close in progress (last subscription left or shutdown).
    Disconnecting,
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// Whether frames written now would reach the wire.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connected)
    }
}

// ---------------------------------------------------------------------------
// Trade side
// ---------------------------------------------------------------------------

/// Taker direction of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    #[serde(alias = "buy")]
    Long,
    #[serde(alias = "sell")]
    Short,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parsing() {
        assert_eq!("mainnet".parse::<Env>().unwrap(), Env::Mainnet);
        assert_eq!("Devnet".parse::<Env>().unwrap(), Env::Devnet);
        assert!("testnet".parse::<Env>().is_err());
    }

    #[test]
    fn trade_side_aliases() {
        let side: TradeSide = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(side, TradeSide::Short);
        let side: TradeSide = serde_json::from_str("\"long\"").unwrap();
        assert_eq!(side, TradeSide::Long);
    }
}
