//! Subscription broker.
//!
//! Turns subscribe requests into subscribers attached to a compatible
//! [`Feed`], opening a new feed through the multiplexer only when none fits:
//!
//! - a **candle** request `(env, market, resolution)` shares only the feed with
//!   exactly that key;
//! - a **trade** request `(env, market)` shares any feed of the market (trades
//!   ride along in candle updates), else opens one at the default trade
//!   resolution.
//!
//! A feed is torn down when its last subscriber of either kind leaves.
//! Subscribers of the other kind left on a feed are not moved to a different
//! compatible feed; they keep their feed alive until they unsubscribe.
//!
//! All tables live in one [`BrokerState`] behind one lock, so a feed is added
//! to or removed from both lookup tables in the same critical section. A
//! removed feed is closed outside the lock; until it is gone, a subscribe for
//! the same key waits instead of opening a second upstream subscription.

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::task::{Context, Poll};

use ahash::AHashMap;
use fm_core::config::AppConfig;
use fm_core::error::{FeedError, Result};
use fm_core::types::{Env, Resolution, SubscriptionKind, ValidationMode};
use fm_core::ws::ConnectionMultiplexer;
use futures_util::Stream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::event::FeedEvent;
use crate::feed::{Feed, FeedKey};

/// A logical subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub kind: SubscriptionKind,
    pub env: Env,
    pub market: String,
    /// Required for candles. For trades, the resolution to open a new feed
    /// at if the market has none.
    pub resolution: Option<Resolution>,
}

impl SubscribeRequest {
    pub fn candles(env: Env, market: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            kind: SubscriptionKind::Candles,
            env,
            market: market.into(),
            resolution: Some(resolution),
        }
    }

    pub fn trades(env: Env, market: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::Trades,
            env,
            market: market.into(),
            resolution: None,
        }
    }
}

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// WebSocket URL per environment.
    pub urls: HashMap<Env, String>,
    /// Resolution opened for trade requests on a market without a feed.
    pub default_trade_resolution: Resolution,
    pub validation: ValidationMode,
}

impl BrokerConfig {
    pub fn new(urls: HashMap<Env, String>) -> Self {
        Self {
            urls,
            default_trade_resolution: Resolution::SMALLEST,
            validation: ValidationMode::default(),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            urls: config.ws_urls(),
            default_trade_resolution: config.effective_trade_resolution(),
            validation: config.validation_mode(),
        }
    }
}

struct SubscriberRecord {
    kind: SubscriptionKind,
    feed: FeedKey,
}

#[derive(Default)]
struct BrokerState {
    /// Candle compatibility: exact key → feed.
    feeds: HashMap<FeedKey, Feed>,
    /// Trade compatibility: market → resolutions with a live feed.
    trade_index: HashMap<(Env, String), BTreeSet<Resolution>>,
    subscribers: AHashMap<Uuid, SubscriberRecord>,
    /// Feeds removed but still closing. The sender side is dropped once the
    /// close is done.
    closing: HashMap<FeedKey, watch::Receiver<()>>,
    shut_down: bool,
}

impl BrokerState {
    fn insert_feed(&mut self, feed: Feed) {
        let key = feed.key().clone();
        self.trade_index.entry((key.env, key.market.clone())).or_default().insert(key.resolution);
        self.feeds.insert(key, feed);
    }

    fn remove_feed(&mut self, key: &FeedKey) -> Option<Feed> {
        let feed = self.feeds.remove(key)?;
        let market = (key.env, key.market.clone());
        if let Some(resolutions) = self.trade_index.get_mut(&market) {
            resolutions.remove(&key.resolution);
            if resolutions.is_empty() {
                self.trade_index.remove(&market);
            }
        }
        Some(feed)
    }

    /// Existing feed a trade request can ride on. Picks the smallest
    /// resolution so the choice is deterministic.
    fn trade_feed_for(&self, env: Env, market: &str) -> Option<FeedKey> {
        let resolutions = self.trade_index.get(&(env, market.to_string()))?;
        resolutions.first().map(|r| FeedKey::new(env, market, *r))
    }
}

/// Matches subscribe requests to shared feeds.
pub struct SubscriptionBroker {
    mux: ConnectionMultiplexer,
    config: BrokerConfig,
    state: Mutex<BrokerState>,
}

impl SubscriptionBroker {
    pub fn new(mux: ConnectionMultiplexer, config: BrokerConfig) -> Self {
        Self {
            mux,
            config,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Attach a new subscriber to a compatible feed, opening one if needed.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscriberHandle> {
        if request.market.trim().is_empty() {
            return Err(FeedError::InvalidRequest("empty market".into()));
        }
        let url = self
            .config
            .urls
            .get(&request.env)
            .ok_or_else(|| {
                FeedError::Config(format!("no endpoint configured for {}", request.env))
            })?;

        let (mut state, key) = loop {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(FeedError::Shutdown);
            }
            let key = self.feed_key_for(&state, &request)?;
            // a sender that is already gone belongs to an abandoned close
            let closing = state
                .closing
                .get(&key)
                .filter(|done| done.has_changed().is_ok())
                .cloned();
            match closing {
                Some(mut done) => {
                    drop(state);
                    debug!("[broker] {key} is still closing, waiting");
                    let _ = done.changed().await;
                }
                None => {
                    state.closing.remove(&key);
                    break (state, key);
                }
            }
        };

        if !state.feeds.contains_key(&key) {
            let feed = Feed::open(&self.mux, url, key.clone(), self.config.validation).await?;
            state.insert_feed(feed);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = state.feeds.get_mut(&key).ok_or(FeedError::Shutdown)?;
        feed.attach(id, request.kind, tx)?;
        let (candles, trades) = feed.subscriber_counts();
        let record = SubscriberRecord {
            kind: request.kind,
            feed: key.clone(),
        };
        state.subscribers.insert(id, record);

        info!(
            "[broker] {:?} subscriber {id} on {key} (candles={candles}, trades={trades})",
            request.kind
        );
        Ok(SubscriberHandle {
            id,
            kind: request.kind,
            key,
            rx,
        })
    }

    /// Feed a request maps to: the exact key for candles, any feed of the
    /// market for trades.
    fn feed_key_for(&self, state: &BrokerState, request: &SubscribeRequest) -> Result<FeedKey> {
        let key = match request.kind {
            SubscriptionKind::Candles => {
                let resolution = request.resolution.ok_or_else(|| {
                    FeedError::InvalidRequest("candle subscription without resolution".into())
                })?;
                FeedKey::new(request.env, request.market.as_str(), resolution)
            }
            SubscriptionKind::Trades => state
                .trade_feed_for(request.env, &request.market)
                .unwrap_or_else(|| {
                    let resolution = request
                        .resolution
                        .unwrap_or(self.config.default_trade_resolution);
                    FeedKey::new(request.env, request.market.as_str(), resolution)
                }),
        };
        Ok(key)
    }

    /// Detach a subscriber. The feed goes away with its last subscriber.
    ///
    /// Unknown ids, including ids already unsubscribed, fail with
    /// [`FeedError::SubscriberNotFound`].
    pub async fn unsubscribe(&self, id: Uuid) -> Result<()> {
        let (feed, done) = {
            let mut state = self.state.lock().await;
            let record = state
                .subscribers
                .remove(&id)
                .ok_or(FeedError::SubscriberNotFound(id))?;

            let idle = match state.feeds.get_mut(&record.feed) {
                Some(feed) => {
                    feed.detach(id);
                    feed.is_idle()
                }
                None => false,
            };
            debug!("[broker] {:?} subscriber {id} left {}", record.kind, record.feed);
            if !idle {
                return Ok(());
            }
            let Some(feed) = state.remove_feed(&record.feed) else {
                return Ok(());
            };
            let (done, closing) = watch::channel(());
            state.closing.insert(record.feed, closing);
            (feed, done)
        };

        let key = feed.key().clone();
        feed.close().await;
        self.state.lock().await.closing.remove(&key);
        drop(done);
        Ok(())
    }

    /// Tear down every feed. Later subscribes fail with
    /// [`FeedError::Shutdown`].
    pub async fn shutdown(&self) {
        let feeds: Vec<Feed> = {
            let mut state = self.state.lock().await;
            state.shut_down = true;
            state.subscribers.clear();
            let keys: Vec<FeedKey> = state.feeds.keys().cloned().collect();
            keys.iter().filter_map(|key| state.remove_feed(key)).collect()
        };
        info!("[broker] shutting down {} feeds", feeds.len());
        for feed in feeds {
            feed.close().await;
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    pub async fn feed_count(&self) -> usize {
        self.state.lock().await.feeds.len()
    }

    /// Keys of live feeds, sorted.
    pub async fn feed_keys(&self) -> Vec<FeedKey> {
        let state = self.state.lock().await;
        let mut keys: Vec<FeedKey> = state.feeds.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// `(candle, trade)` subscriber counts of one feed.
    pub async fn feed_subscribers(&self, key: &FeedKey) -> Option<(usize, usize)> {
        self.state.lock().await.feeds.get(key).map(Feed::subscriber_counts)
    }
}

/// A subscriber's end of its feed.
///
/// Dropping the handle stops delivery but does not unsubscribe; call
/// [`SubscriptionBroker::unsubscribe`] with [`id`](Self::id).
#[derive(Debug)]
pub struct SubscriberHandle {
    id: Uuid,
    kind: SubscriptionKind,
    key: FeedKey,
    rx: mpsc::UnboundedReceiver<FeedEvent>,
}

impl SubscriberHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Feed this subscriber is attached to.
    pub fn feed_key(&self) -> &FeedKey {
        &self.key
    }

    /// Next event; `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for SubscriberHandle {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FeedEvent>> {
        self.rx.poll_recv(cx)
    }
}
