//! Configuration parsing.
//!
//! Everything is read from a single JSON file. Optional fields fall back to
//! defaults through the `effective_*` accessors, so a minimal config only
//! needs an endpoint per environment in use.
//!
//! # Example
//!
//! ```json
//! {
//!   "logging": { "module_name": "fm-runner", "log_path": "/tmp/log" },
//!   "endpoints": {
//!     "mainnet": { "ws_url": "wss://data.api.example/ws", "rest_url": "https://data.api.example" }
//!   },
//!   "reconnect": {
//!     "base_delay_ms": 1000, "max_delay_ms": 8000, "window_sec": 60, "max_attempts": 5
//!   },
//!   "sequence": { "jump_threshold": 100, "resume_debounce_ms": 2000 },
//!   "candles": { "strict": false, "history_limit": 500, "max_bars": 1000 },
//!   "charts": [{ "env": "mainnet", "market": "SOL-PERP", "resolution": "1m", "trades": true }]
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FeedError, Result};
use crate::sequence::SequenceConfig;
use crate::types::{Env, Resolution, ValidationMode};
use crate::ws::reconnect::ReconnectPolicy;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Log file naming and format.
    pub logging: Option<LoggingConfig>,

    /// Data endpoints per environment.
    pub endpoints: HashMap<Env, EndpointConfig>,

    /// Reconnect backoff; see [`ReconnectConfig`].
    pub reconnect: Option<ReconnectConfig>,

    /// Client keep-alive ping interval in seconds. No pings when absent.
    pub ping_interval_sec: Option<u64>,

    /// Sequence guard tuning.
    pub sequence: Option<SequenceConfig>,

    /// Candle handling.
    pub candles: Option<CandleConfig>,

    /// Wall-clock jump (ms) that the runner treats as a process suspension.
    pub suspend_threshold_ms: Option<u64>,

    /// Charts the runner keeps live.
    #[serde(default)]
    pub charts: Vec<ChartConfig>,
}

/// Logging block.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    pub json: Option<bool>,
}

/// One environment's endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket URL carrying candle/trade subscriptions.
    pub ws_url: String,
    /// Base URL of the historical candle REST API.
    pub rest_url: Option<String>,
}

/// Reconnect backoff block, all fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReconnectConfig {
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub window_sec: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Candle handling block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandleConfig {
    /// Reject invalid candles instead of clamping them.
    pub strict: Option<bool>,
    /// Page size when seeding charts from the REST API.
    pub history_limit: Option<u32>,
    /// Recent-window size kept per chart.
    pub max_bars: Option<usize>,
    /// Resolution opened for trade-only subscriptions.
    pub default_trade_resolution: Option<Resolution>,
}

/// A chart the runner keeps live.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartConfig {
    #[serde(default)]
    pub env: Env,
    pub market: String,
    pub resolution: Resolution,
    /// Also subscribe to the market's trade prints.
    #[serde(default)]
    pub trades: bool,
}

impl AppConfig {
    /// Endpoints for `env`, or a config error if none are configured.
    pub fn endpoint(&self, env: Env) -> Result<&EndpointConfig> {
        self.endpoints
            .get(&env)
            .ok_or_else(|| FeedError::Config(format!("no endpoint configured for {env}")))
    }

    /// WebSocket URL per environment.
    pub fn ws_urls(&self) -> HashMap<Env, String> {
        self.endpoints.iter().map(|(env, ep)| (*env, ep.ws_url.clone())).collect()
    }

    /// Backoff policy with defaults applied.
    pub fn effective_reconnect(&self) -> ReconnectPolicy {
        let d = ReconnectPolicy::default();
        let Some(r) = &self.reconnect else {
            return d;
        };
        ReconnectPolicy {
            base_delay: r.base_delay_ms.map(Duration::from_millis).unwrap_or(d.base_delay),
            max_delay: r.max_delay_ms.map(Duration::from_millis).unwrap_or(d.max_delay),
            window: r.window_sec.map(Duration::from_secs).unwrap_or(d.window),
            max_attempts: r.max_attempts.unwrap_or(d.max_attempts),
        }
    }

    pub fn effective_ping_interval(&self) -> Option<Duration> {
        self.ping_interval_sec.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn effective_sequence(&self) -> SequenceConfig {
        self.sequence.unwrap_or_default()
    }

    pub fn validation_mode(&self) -> ValidationMode {
        match self.candles.as_ref().and_then(|c| c.strict) {
            Some(true) => ValidationMode::Strict,
            _ => ValidationMode::Lenient,
        }
    }

    pub fn effective_history_limit(&self) -> u32 {
        self.candles.as_ref().and_then(|c| c.history_limit).unwrap_or(500)
    }

    pub fn effective_max_bars(&self) -> usize {
        self.candles.as_ref().and_then(|c| c.max_bars).unwrap_or(1_000)
    }

    pub fn effective_trade_resolution(&self) -> Resolution {
        self.candles
            .as_ref()
            .and_then(|c| c.default_trade_resolution)
            .unwrap_or(Resolution::SMALLEST)
    }

    pub fn effective_suspend_threshold(&self) -> Duration {
        Duration::from_millis(self.suspend_threshold_ms.unwrap_or(5_000))
    }

    pub fn module_name(&self) -> String {
        self.logging
            .as_ref()
            .and_then(|l| l.module_name.clone())
            .unwrap_or_else(|| "fm-runner".to_string())
    }

    pub fn log_path(&self) -> Option<String> {
        self.logging.as_ref().and_then(|l| l.log_path.clone())
    }

    pub fn log_json(&self) -> bool {
        self.logging.as_ref().and_then(|l| l.json).unwrap_or(false)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for chart in &self.charts {
            self.endpoint(chart.env)?;
            if chart.market.trim().is_empty() {
                return Err(FeedError::Config("chart with empty market".into()));
            }
        }
        let policy = self.effective_reconnect();
        if policy.max_attempts == 0 {
            return Err(FeedError::Config("reconnect.max_attempts must be at least 1".into()));
        }
        if policy.base_delay > policy.max_delay {
            return Err(FeedError::Config("reconnect.base_delay_ms exceeds max_delay_ms".into()));
        }
        Ok(())
    }
}

/// Parse a JSON config string and validate it.
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig =
        serde_json::from_str(content).map_err(|e| FeedError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FeedError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "logging": { "module_name": "charts", "json": true },
        "endpoints": {
            "mainnet": { "ws_url": "wss://data.example/ws", "rest_url": "https://data.example" },
            "devnet": { "ws_url": "wss://dev.example/ws" }
        },
        "reconnect": { "max_attempts": 3 },
        "ping_interval_sec": 20,
        "sequence": { "jump_threshold": 10 },
        "candles": { "strict": true, "max_bars": 50, "default_trade_resolution": "5m" },
        "charts": [
            { "env": "mainnet", "market": "SOL-PERP", "resolution": "1m", "trades": true },
            { "env": "devnet", "market": "BTC-PERP", "resolution": "60" }
        ]
    }"#;

    #[test]
    fn parses_full_config() {
        let cfg = parse_config(FULL).unwrap();
        assert_eq!(cfg.module_name(), "charts");
        assert!(cfg.log_json());
        assert_eq!(cfg.endpoint(Env::Devnet).unwrap().ws_url, "wss://dev.example/ws");
        assert_eq!(cfg.effective_ping_interval(), Some(Duration::from_secs(20)));
        assert_eq!(cfg.effective_sequence().jump_threshold, 10);
        assert_eq!(cfg.effective_sequence().resume_debounce, Duration::from_millis(2_000));
        assert_eq!(cfg.validation_mode(), ValidationMode::Strict);
        assert_eq!(cfg.effective_max_bars(), 50);
        assert_eq!(cfg.effective_trade_resolution(), Resolution::FiveMinutes);
        assert_eq!(cfg.charts.len(), 2);
        assert_eq!(cfg.charts[1].resolution, Resolution::OneHour);
        assert!(!cfg.charts[1].trades);

        let policy = cfg.effective_reconnect();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1_000));
        assert_eq!(policy.max_delay, Duration::from_millis(8_000));
        assert_eq!(policy.window, Duration::from_secs(60));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let json = r#"{ "endpoints": { "mainnet": { "ws_url": "wss://x/ws" } } }"#;
        let cfg = parse_config(json).unwrap();
        assert_eq!(cfg.validation_mode(), ValidationMode::Lenient);
        assert_eq!(cfg.effective_history_limit(), 500);
        assert_eq!(cfg.effective_trade_resolution(), Resolution::OneMinute);
        assert_eq!(cfg.effective_ping_interval(), None);
        assert_eq!(cfg.effective_suspend_threshold(), Duration::from_secs(5));
        assert!(cfg.charts.is_empty());
    }

    #[test]
    fn chart_without_endpoint_is_rejected() {
        let json = r#"{
            "endpoints": { "mainnet": { "ws_url": "wss://x/ws" } },
            "charts": [{ "env": "devnet", "market": "SOL-PERP", "resolution": "1" }]
        }"#;
        assert!(matches!(parse_config(json), Err(FeedError::Config(_))));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let json = r#"{ "endpoints": {}, "reconnect": { "max_attempts": 0 } }"#;
        assert!(parse_config(json).is_err());
    }
}
