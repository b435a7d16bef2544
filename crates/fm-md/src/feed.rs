//! One upstream subscription and its fan-out.
//!
//! A [`Feed`] owns the multiplexer registration for `(env, market,
//! resolution)` and a pump task that decodes the subscription's frames and
//! forwards them to attached subscribers: candle updates to candle
//! subscribers, trade batches to trade subscribers, status to both.
//!
//! Attach/detach go through the pump's control channel, so a subscriber sees
//! exactly the events that arrive between its attach and its detach, in
//! arrival order.

use std::fmt;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use fm_core::error::{FeedError, Result};
use fm_core::types::{Env, Resolution, SubscriptionKind, ValidationMode};
use fm_core::ws::{ConnectionMultiplexer, StreamEvent, SubscriptionHandle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::event::{CandleUpdate, FeedEvent, FeedStatus, TradeBatch};
use crate::protocol::{self, InboundFrame};

/// Identity of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey {
    pub env: Env,
    pub market: String,
    pub resolution: Resolution,
}

impl FeedKey {
    pub fn new(env: Env, market: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            env,
            market: market.into(),
            resolution,
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.env, self.market, self.resolution)
    }
}

pub(crate) type EventSender = mpsc::UnboundedSender<FeedEvent>;

enum SinkCommand {
    Attach {
        id: Uuid,
        kind: SubscriptionKind,
        tx: EventSender,
    },
    Detach(Uuid),
}

/// A live upstream subscription. Bookkeeping is done by the broker under its
/// lock; the pump only sees attach/detach commands.
pub(crate) struct Feed {
    key: FeedKey,
    candle_subscribers: AHashSet<Uuid>,
    trade_subscribers: AHashSet<Uuid>,
    control: mpsc::UnboundedSender<SinkCommand>,
    handle: SubscriptionHandle,
    pump: JoinHandle<()>,
}

impl Feed {
    /// Register with the multiplexer and start the pump.
    pub(crate) async fn open(
        mux: &ConnectionMultiplexer,
        url: &str,
        key: FeedKey,
        mode: ValidationMode,
    ) -> Result<Self> {
        let spec = protocol::subscription_spec(url, &key);
        let (handle, events) = mux.open_subscription(spec).await?;
        let (control, control_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(key.clone(), events, control_rx, mode));
        info!("[feed {key}] opened on {url}");
        Ok(Self {
            key,
            candle_subscribers: AHashSet::new(),
            trade_subscribers: AHashSet::new(),
            control,
            handle,
            pump,
        })
    }

    pub(crate) fn key(&self) -> &FeedKey {
        &self.key
    }

    /// Hand a subscriber to the pump. Fails with [`FeedError::Shutdown`] if
    /// the pump has stopped; the subscriber is not counted then.
    pub(crate) fn attach(
        &mut self,
        id: Uuid,
        kind: SubscriptionKind,
        tx: EventSender,
    ) -> Result<()> {
        self.control
            .send(SinkCommand::Attach { id, kind, tx })
            .map_err(|_| FeedError::Shutdown)?;
        match kind {
            SubscriptionKind::Candles => self.candle_subscribers.insert(id),
            SubscriptionKind::Trades => self.trade_subscribers.insert(id),
        };
        Ok(())
    }

    pub(crate) fn detach(&mut self, id: Uuid) {
        self.candle_subscribers.remove(&id);
        self.trade_subscribers.remove(&id);
        let _ = self.control.send(SinkCommand::Detach(id));
    }

    /// `(candle subscribers, trade subscribers)`.
    pub(crate) fn subscriber_counts(&self) -> (usize, usize) {
        (self.candle_subscribers.len(), self.trade_subscribers.len())
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.candle_subscribers.is_empty() && self.trade_subscribers.is_empty()
    }

    /// Release the multiplexer registration and stop the pump.
    pub(crate) async fn close(self) {
        info!("[feed {}] closing", self.key);
        self.handle.unsubscribe().await;
        drop(self.control);
        if let Err(e) = self.pump.await {
            warn!("[feed {}] pump task failed: {e}", self.key);
        }
    }
}

/// Decode and fan out until the feed is closed.
async fn pump(
    key: FeedKey,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    mut control: mpsc::UnboundedReceiver<SinkCommand>,
    mode: ValidationMode,
) {
    let mut sinks = Sinks::default();
    loop {
        tokio::select! {
            biased;
            cmd = control.recv() => match cmd {
                Some(SinkCommand::Attach { id, kind, tx }) => sinks.attach(id, kind, tx),
                Some(SinkCommand::Detach(id)) => sinks.detach(id),
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => dispatch(&key, event, mode, &mut sinks),
                None => break,
            },
        }
    }
    debug!("[feed {key}] pump stopped");
}

#[derive(Default)]
struct Sinks {
    candles: AHashMap<Uuid, EventSender>,
    trades: AHashMap<Uuid, EventSender>,
}

impl Sinks {
    fn attach(&mut self, id: Uuid, kind: SubscriptionKind, tx: EventSender) {
        match kind {
            SubscriptionKind::Candles => self.candles.insert(id, tx),
            SubscriptionKind::Trades => self.trades.insert(id, tx),
        };
    }

    fn detach(&mut self, id: Uuid) {
        self.candles.remove(&id);
        self.trades.remove(&id);
    }

    fn to_candles(&mut self, event: FeedEvent) {
        send_all(&mut self.candles, &event);
    }

    fn to_trades(&mut self, event: FeedEvent) {
        send_all(&mut self.trades, &event);
    }

    fn to_all(&mut self, event: FeedEvent) {
        send_all(&mut self.candles, &event);
        send_all(&mut self.trades, &event);
    }
}

/// Send to every sink, forgetting sinks whose receiver is gone.
fn send_all(sinks: &mut AHashMap<Uuid, EventSender>, event: &FeedEvent) {
    sinks.retain(|_, tx| tx.send(event.clone()).is_ok());
}

fn dispatch(key: &FeedKey, event: StreamEvent, mode: ValidationMode, sinks: &mut Sinks) {
    match event {
        StreamEvent::Message { frame, received_at_ms } => match protocol::decode(&frame) {
            Ok(InboundFrame::Update(update)) => {
                match update.to_candle(mode) {
                    Ok(candle) => sinks.to_candles(FeedEvent::Candle(CandleUpdate {
                        env: key.env,
                        market: key.market.clone(),
                        candle,
                        slot: update.slot,
                        received_at_ms,
                    })),
                    Err(e) => {
                        warn!("[feed {key}] dropping candle: {e}");
                        sinks.to_candles(FeedEvent::Status(FeedStatus::Error(e.to_string())));
                    }
                }
                let trades = update.to_trades();
                if !trades.is_empty() {
                    sinks.to_trades(FeedEvent::Trades(Arc::new(TradeBatch {
                        env: key.env,
                        market: key.market.clone(),
                        trades,
                        slot: update.slot,
                        received_at_ms,
                    })));
                }
            }
            Ok(InboundFrame::Error { message, .. }) => {
                let message = message.unwrap_or_else(|| "upstream error".to_string());
                warn!("[feed {key}] upstream error: {message}");
                sinks.to_all(FeedEvent::Status(FeedStatus::Error(message)));
            }
            Ok(InboundFrame::Init | InboundFrame::Subscription { .. } | InboundFrame::Create) => {
                debug!("[feed {key}] control frame");
            }
            Ok(InboundFrame::Unknown) => trace!("[feed {key}] ignoring unknown frame"),
            Err(e) => {
                warn!("[feed {key}] undecodable frame: {e}");
                sinks.to_all(FeedEvent::Status(FeedStatus::Error(e.to_string())));
            }
        },
        StreamEvent::Error(e @ FeedError::ReconnectExhausted { .. }) => {
            sinks.to_all(FeedEvent::Status(FeedStatus::Unavailable(e.to_string())));
        }
        StreamEvent::Error(e) => sinks.to_all(FeedEvent::Status(FeedStatus::Error(e.to_string()))),
        StreamEvent::Reconnecting { attempt, delay } => {
            sinks.to_all(FeedEvent::Status(FeedStatus::Reconnecting { attempt, delay }));
        }
        StreamEvent::Resubscribed => sinks.to_all(FeedEvent::Status(FeedStatus::Resubscribed)),
        StreamEvent::Closed => sinks.to_all(FeedEvent::Status(FeedStatus::Closed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> FeedKey {
        FeedKey::new(Env::Mainnet, "SOL-PERP", Resolution::OneMinute)
    }

    fn message(frame: serde_json::Value) -> StreamEvent {
        StreamEvent::Message {
            frame: Arc::new(frame),
            received_at_ms: 1,
        }
    }

    fn update(with_trades: bool) -> serde_json::Value {
        let trades = if with_trades {
            json!([{ "ts": 1_700_000_050u64, "price": 12.0, "baseAmount": 2.0 }])
        } else {
            json!([])
        };
        json!({
            "type": "update", "symbol": "SOL-PERP", "resolution": "1", "slot": 7,
            "candle": {
                "ts": 1_700_000_040u64,
                "fillOpen": 10, "fillHigh": 12, "fillLow": 9, "fillClose": 11,
                "oracleOpen": 10, "oracleHigh": 12, "oracleLow": 9, "oracleClose": 11,
                "quoteVolume": 5, "baseVolume": 1
            },
            "trades": trades
        })
    }

    #[test]
    fn update_fans_out_by_kind() {
        let mut sinks = Sinks::default();
        let (ctx, mut crx) = mpsc::unbounded_channel();
        let (ttx, mut trx) = mpsc::unbounded_channel();
        sinks.attach(Uuid::new_v4(), SubscriptionKind::Candles, ctx);
        sinks.attach(Uuid::new_v4(), SubscriptionKind::Trades, ttx);

        dispatch(&key(), message(update(true)), ValidationMode::Lenient, &mut sinks);
        match crx.try_recv().unwrap() {
            FeedEvent::Candle(u) => {
                assert_eq!(u.slot, Some(7));
                assert_eq!(u.candle.fill().close, 11.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match trx.try_recv().unwrap() {
            FeedEvent::Trades(batch) => assert_eq!(batch.trades.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert!(crx.try_recv().is_err());
        assert!(trx.try_recv().is_err());

        // no trades in the frame → nothing for trade subscribers
        dispatch(&key(), message(update(false)), ValidationMode::Lenient, &mut sinks);
        assert!(matches!(crx.try_recv(), Ok(FeedEvent::Candle(_))));
        assert!(trx.try_recv().is_err());
    }

    #[test]
    fn status_goes_to_everyone() {
        let mut sinks = Sinks::default();
        let (ctx, mut crx) = mpsc::unbounded_channel();
        let (ttx, mut trx) = mpsc::unbounded_channel();
        sinks.attach(Uuid::new_v4(), SubscriptionKind::Candles, ctx);
        sinks.attach(Uuid::new_v4(), SubscriptionKind::Trades, ttx);

        let fatal = FeedError::ReconnectExhausted {
            url: "mem://x".into(),
            attempts: 5,
        };
        dispatch(&key(), StreamEvent::Error(fatal), ValidationMode::Lenient, &mut sinks);
        for rx in [&mut crx, &mut trx] {
            assert!(matches!(rx.try_recv(), Ok(FeedEvent::Status(FeedStatus::Unavailable(_)))));
        }

        let upstream = message(json!({"type": "error", "symbol": "SOL-PERP", "message": "nope"}));
        dispatch(&key(), upstream, ValidationMode::Lenient, &mut sinks);
        for rx in [&mut crx, &mut trx] {
            assert!(matches!(
                rx.try_recv(),
                Ok(FeedEvent::Status(FeedStatus::Error(m))) if m == "nope"
            ));
        }
    }

    #[test]
    fn strict_mode_reports_invalid_candle() {
        let mut sinks = Sinks::default();
        let (ctx, mut crx) = mpsc::unbounded_channel();
        sinks.attach(Uuid::new_v4(), SubscriptionKind::Candles, ctx);

        let mut frame = update(false);
        frame["candle"]["fillHigh"] = json!(1);
        dispatch(&key(), message(frame), ValidationMode::Strict, &mut sinks);
        assert!(matches!(crx.try_recv(), Ok(FeedEvent::Status(FeedStatus::Error(_)))));
    }

    #[test]
    fn dropped_receivers_are_forgotten() {
        let mut sinks = Sinks::default();
        let (ctx, crx) = mpsc::unbounded_channel();
        sinks.attach(Uuid::new_v4(), SubscriptionKind::Candles, ctx);
        drop(crx);
        dispatch(&key(), StreamEvent::Closed, ValidationMode::Lenient, &mut sinks);
        assert!(sinks.candles.is_empty());
    }
}
