//! Live bars built from trade prints.
//!
//! Each accepted trade becomes a single-trade candle that is folded into the
//! bar for its bucket (first open wins, extremes widen, volumes sum). Trades
//! are gated per slot, so a batch from a regressed slot is skipped. Within the
//! newest slot a trade is applied once: a redelivered print with the same
//! time, price and size is dropped.
//!
//! Trades are validated like candles. In lenient mode a trade stamped in the
//! future lands in the current bucket; a non-finite price is skipped.

use ahash::AHashSet;
use fm_core::sequence::{SequenceConfig, SequenceGuard};
use fm_core::time_util;
use fm_core::types::{Candle, Resolution, Trade, ValidationMode};
use tracing::{trace, warn};

use crate::chart::BarWindow;
use crate::event::TradeBatch;

/// Identity of a print within one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PrintKey {
    ts_ms: u64,
    price: u64,
    base_amount: u64,
}

impl PrintKey {
    fn of(trade: &Trade) -> Self {
        Self {
            ts_ms: trade.ts_ms,
            price: trade.price.to_bits(),
            base_amount: trade.base_amount.to_bits(),
        }
    }
}

pub struct TradeBars {
    market: String,
    resolution: Resolution,
    mode: ValidationMode,
    stream_key: String,
    window: BarWindow,
    guard: SequenceGuard,
    /// Slot the `seen` prints belong to.
    seen_slot: Option<u64>,
    seen: AHashSet<PrintKey>,
}

impl TradeBars {
    pub fn new(
        market: impl Into<String>,
        resolution: Resolution,
        max_bars: usize,
        sequence: SequenceConfig,
    ) -> Self {
        let market = market.into();
        let stream_key = format!("trades:{market}");
        Self {
            market,
            resolution,
            mode: ValidationMode::default(),
            stream_key,
            window: BarWindow::new(max_bars),
            guard: SequenceGuard::new(sequence),
            seen_slot: None,
            seen: AHashSet::new(),
        }
    }

    pub fn with_validation(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fold a batch into the bars. Returns how many trades were applied.
    pub fn apply(&mut self, batch: &TradeBatch) -> usize {
        self.apply_at(batch, time_util::now_ms())
    }

    pub fn apply_at(&mut self, batch: &TradeBatch, now_ms: u64) -> usize {
        if batch.market != self.market {
            return 0;
        }
        let mut applied = 0;
        for trade in &batch.trades {
            let candle = match Candle::from_trade(trade, self.resolution, self.mode, now_ms) {
                Ok(candle) => candle,
                Err(e) => {
                    warn!("[trades {}] skipping {trade}: {e}", self.market);
                    continue;
                }
            };
            let slot = trade.slot.or(batch.slot);
            if !self.guard.accept_at(&self.stream_key, slot, Some(batch.received_at_ms), now_ms) {
                trace!("[trades {}] skipping {trade}", self.market);
                continue;
            }
            if self.is_repeat(slot, trade) {
                trace!("[trades {}] already applied {trade}", self.market);
                continue;
            }
            if self.window.accumulate(candle) {
                applied += 1;
            }
        }
        applied
    }

    /// Record `trade` for its slot; `true` if it was seen before. Trades
    /// without a slot cannot be told apart and always count as new.
    fn is_repeat(&mut self, slot: Option<u64>, trade: &Trade) -> bool {
        let Some(slot) = slot else {
            return false;
        };
        if self.seen_slot != Some(slot) {
            self.seen_slot = Some(slot);
            self.seen.clear();
        }
        !self.seen.insert(PrintKey::of(trade))
    }

    pub fn on_resubscribed(&mut self) {
        self.guard.reset(&self.stream_key);
        self.seen_slot = None;
        self.seen.clear();
    }

    pub fn notify_resume(&mut self) {
        self.guard.notify_resume();
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Bars oldest first.
    pub fn bars(&self) -> Vec<Candle> {
        self.window.bars()
    }

    pub fn last_bar(&self) -> Option<&Candle> {
        self.window.last()
    }
}
