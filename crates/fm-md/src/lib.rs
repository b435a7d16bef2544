//! # fm-md
//!
//! Candle and trade market data on top of the `fm-core` multiplexer.
//!
//! ## Architecture
//!
//! A consumer asks the [`broker::SubscriptionBroker`] for a candle or trade
//! stream. The broker attaches it to a compatible [`feed::Feed`] or opens one
//! through the shared connection multiplexer; the feed's pump decodes frames
//! with [`protocol`] and fans them out as [`event::FeedEvent`]s.
//!
//! ## Consumers
//!
//! - [`chart`]: `CandleChart`, a sequence-guarded, gap-free bar window
//! - [`trades`]: `TradeBars`, bars built from trade prints
//! - [`history`]: single-page REST candle history for seeding charts

pub mod broker;
pub mod chart;
pub mod event;
pub mod feed;
pub mod history;
pub mod protocol;
pub mod trades;

pub use broker::{BrokerConfig, SubscribeRequest, SubscriberHandle, SubscriptionBroker};
pub use chart::CandleChart;
pub use event::{CandleUpdate, FeedEvent, FeedStatus, TradeBatch};
pub use feed::FeedKey;
pub use history::HistoryClient;
pub use trades::TradeBars;
