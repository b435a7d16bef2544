//! # fm-core
//!
//! Core crate for the candle/trade feed multiplexer, providing:
//!
//! - **Types** (`types`): resolutions, candles with their safety clamp and
//!   strict check, trades, shared enums
//! - **Aggregation** (`aggregate`): merge, stitch, gap-fill and rebucket
//! - **Sequence guard** (`sequence`): per-stream monotonic filter with resume
//!   catch-up
//! - **WebSocket** (`ws`): transport traits, tungstenite and in-memory
//!   connectors, reconnect backoff, the connection multiplexer
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): domain-specific `FeedError` via thiserror
//! - **JSON helpers** (`json_util`): numeric-string tolerant decoding
//! - **Time utilities** (`time_util`): epoch timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod aggregate;
pub mod config;
pub mod error;
pub mod json_util;
pub mod logging;
pub mod sequence;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
