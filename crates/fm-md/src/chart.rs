//! Live chart state for one `(market, resolution)`.
//!
//! [`CandleChart`] keeps a bounded, gap-free window of bars: seeded from REST
//! history, then advanced by live candle updates that pass its
//! [`SequenceGuard`]. Upstream candles are cumulative within their bucket, so
//! an update for the newest bucket replaces that bar; an update for a later
//! bucket blank-fills the skipped buckets and continues from the prior close.

use std::collections::VecDeque;

use fm_core::aggregate::{blanks_until, fill_gaps, merge, stitch_candles};
use fm_core::sequence::{SequenceConfig, SequenceGuard};
use fm_core::time_util;
use fm_core::types::{Candle, Resolution};
use tracing::{debug, trace};

use crate::event::CandleUpdate;

// ---------------------------------------------------------------------------
// BarWindow
// ---------------------------------------------------------------------------

/// Bounded, time-ordered, gap-free bar series.
#[derive(Debug, Clone)]
pub(crate) struct BarWindow {
    bars: VecDeque<Candle>,
    max_bars: usize,
}

impl BarWindow {
    pub(crate) fn new(max_bars: usize) -> Self {
        Self {
            bars: VecDeque::new(),
            max_bars: max_bars.max(1),
        }
    }

    pub(crate) fn replace_all(&mut self, bars: Vec<Candle>) {
        self.bars = bars.into();
        self.trim();
    }

    /// Replace the newest bar if `candle` shares its bucket, else append.
    /// The result always continues from the bar before it.
    pub(crate) fn upsert(&mut self, candle: Candle) -> bool {
        let Some(last) = self.bars.back().copied() else {
            self.bars.push_back(candle);
            return true;
        };
        if candle.start() == last.start() {
            let previous = self.bars.len().checked_sub(2).and_then(|i| self.bars.get(i)).copied();
            if let Some(slot) = self.bars.back_mut() {
                *slot = merge(&candle, previous.as_ref());
            }
            true
        } else {
            self.advance(last, candle)
        }
    }

    /// Fold `candle` into the newest bar if it shares its bucket, else append.
    pub(crate) fn accumulate(&mut self, candle: Candle) -> bool {
        let Some(last) = self.bars.back().copied() else {
            self.bars.push_back(candle);
            return true;
        };
        if candle.start() == last.start() {
            if let Some(slot) = self.bars.back_mut() {
                *slot = merge(&candle, Some(&last));
            }
            true
        } else {
            self.advance(last, candle)
        }
    }

    /// Append a bar for a later bucket, blank-filling skipped buckets.
    /// Buckets older than the newest bar are dropped. At most `max_bars - 1`
    /// blanks are created; older ones would be trimmed anyway.
    fn advance(&mut self, last: Candle, candle: Candle) -> bool {
        if candle.start() < last.start() {
            trace!("[chart] dropping bar for past bucket {} < {}", candle.start(), last.start());
            return false;
        }
        let step = candle.resolution().bucket_ms();
        let span = self.max_bars as u64 * step;
        let anchor = if candle.start() - last.start() > span {
            debug!(
                "[chart] gap of {} buckets exceeds the window, keeping the newest {}",
                (candle.start() - last.start()) / step,
                self.max_bars
            );
            self.bars.clear();
            Candle::blank(candle.start() - span, &last)
        } else {
            last
        };
        let blanks = blanks_until(&anchor, candle.start().saturating_sub(step));
        let previous = blanks.last().copied().unwrap_or(anchor);
        self.bars.extend(blanks);
        self.bars.push_back(merge(&candle, Some(&previous)));
        self.trim();
        true
    }

    fn trim(&mut self) {
        while self.bars.len() > self.max_bars {
            self.bars.pop_front();
        }
    }

    pub(crate) fn bars(&self) -> Vec<Candle> {
        self.bars.iter().copied().collect()
    }

    pub(crate) fn last(&self) -> Option<&Candle> {
        self.bars.back()
    }

    pub(crate) fn len(&self) -> usize {
        self.bars.len()
    }
}

// ---------------------------------------------------------------------------
// CandleChart
// ---------------------------------------------------------------------------

pub struct CandleChart {
    market: String,
    resolution: Resolution,
    stream_key: String,
    window: BarWindow,
    guard: SequenceGuard,
}

impl CandleChart {
    pub fn new(
        market: impl Into<String>,
        resolution: Resolution,
        max_bars: usize,
        sequence: SequenceConfig,
    ) -> Self {
        let market = market.into();
        let stream_key = format!("candles:{market}:{}", resolution.as_wire());
        Self {
            market,
            resolution,
            stream_key,
            window: BarWindow::new(max_bars),
            guard: SequenceGuard::new(sequence),
        }
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Replace the window with historical candles: sorted ascending, stitched
    /// into a continuous series, gap-filled, then trimmed to the newest
    /// `max_bars`. Candles of another resolution are ignored.
    pub fn seed(&mut self, history: Vec<Candle>) {
        let history: Vec<Candle> = history
            .into_iter()
            .filter(|c| c.resolution() == self.resolution)
            .collect();
        let series = fill_gaps(&stitch_candles(&history), self.resolution);
        debug!("[chart {}:{}] seeded with {} bars", self.market, self.resolution, series.len());
        self.window.replace_all(series);
    }

    /// Apply a live update. Returns `false` if it was rejected as stale or
    /// does not belong to this chart.
    pub fn apply(&mut self, update: &CandleUpdate) -> bool {
        self.apply_at(update, time_util::now_ms())
    }

    /// [`apply`](Self::apply) with an explicit clock for resume handling.
    pub fn apply_at(&mut self, update: &CandleUpdate, now_ms: u64) -> bool {
        if update.market != self.market || update.candle.resolution() != self.resolution {
            return false;
        }
        let received_at = Some(update.received_at_ms);
        if !self.guard.accept_at(&self.stream_key, update.slot, received_at, now_ms) {
            return false;
        }
        self.window.upsert(update.candle)
    }

    /// Upstream subscription was recreated; sequence numbers start over.
    pub fn on_resubscribed(&mut self) {
        self.guard.reset(&self.stream_key);
    }

    /// The process just resumed from a suspension.
    pub fn notify_resume(&mut self) {
        self.guard.notify_resume();
    }

    pub fn notify_resume_at(&mut self, now_ms: u64) {
        self.guard.notify_resume_at(now_ms);
    }

    /// Bars oldest first.
    pub fn bars(&self) -> Vec<Candle> {
        self.window.bars()
    }

    pub fn last_bar(&self) -> Option<&Candle> {
        self.window.last()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.len() == 0
    }

    pub fn max_bars(&self) -> usize {
        self.window.max_bars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::{CandleProps, Env, Ohlc, ValidationMode};
    use std::time::Duration;

    const MIN: u64 = 60_000;
    const NOW: u64 = 1_700_000_000_000;

    fn candle(start: u64, open: f64, close: f64, volume: f64) -> Candle {
        let fill = Ohlc {
            open,
            high: open.max(close),
            low: open.min(close),
            close,
        };
        let props = CandleProps {
            start,
            resolution: Resolution::OneMinute,
            fill,
            oracle: fill,
            quote_volume: volume * close,
            base_volume: volume,
        };
        Candle::new_at(props, ValidationMode::Strict, NOW).unwrap()
    }

    fn update(c: Candle, slot: Option<u64>) -> CandleUpdate {
        CandleUpdate {
            env: Env::Mainnet,
            market: "SOL-PERP".into(),
            candle: c,
            slot,
            received_at_ms: NOW,
        }
    }

    fn chart(max_bars: usize) -> CandleChart {
        CandleChart::new("SOL-PERP", Resolution::OneMinute, max_bars, SequenceConfig::default())
    }

    #[test]
    fn seed_sorts_stitches_and_fills() {
        let mut c = chart(100);
        c.seed(vec![
            candle(3 * MIN, 12.0, 13.0, 1.0),
            candle(0, 10.0, 11.0, 1.0),
            candle(MIN, 11.5, 12.0, 1.0),
        ]);

        let bars = c.bars();
        let starts: Vec<u64> = bars.iter().map(Candle::start).collect();
        assert_eq!(starts, vec![0, MIN, 2 * MIN, 3 * MIN]);
        assert_eq!(bars[1].fill().open, 11.0);
        assert!(bars[2].is_blank());
        assert_eq!(bars[2].fill().close, 12.0);
        assert_eq!(bars[3].fill().open, 12.0);
    }

    #[test]
    fn seed_trims_to_newest_bars() {
        let mut c = chart(3);
        c.seed((0..10).map(|i| candle(i * MIN, 10.0, 10.0, 1.0)).collect());
        assert_eq!(c.len(), 3);
        assert_eq!(c.bars()[0].start(), 7 * MIN);
    }

    #[test]
    fn same_bucket_update_replaces_newest_bar() {
        let mut c = chart(100);
        c.seed(vec![candle(0, 10.0, 11.0, 1.0)]);

        assert!(c.apply_at(&update(candle(MIN, 11.0, 11.5, 1.0), Some(1)), NOW));
        assert!(c.apply_at(&update(candle(MIN, 11.2, 12.0, 3.0), Some(2)), NOW));

        let bars = c.bars();
        assert_eq!(bars.len(), 2);
        let last = bars[1];
        // cumulative: volume is the latest snapshot, open continues from the prior close
        assert_eq!(last.base_volume(), 3.0);
        assert_eq!(last.fill().open, 11.0);
        assert_eq!(last.fill().close, 12.0);
    }

    #[test]
    fn forward_jump_is_gap_filled() {
        let mut c = chart(100);
        c.seed(vec![candle(0, 10.0, 11.0, 1.0)]);
        assert!(c.apply_at(&update(candle(4 * MIN, 13.0, 14.0, 1.0), Some(5)), NOW));

        let bars = c.bars();
        assert_eq!(bars.len(), 5);
        assert!(bars[1..4].iter().all(|b| b.is_blank() && b.fill().close == 11.0));
        assert_eq!(bars[4].fill().open, 11.0);
        assert_eq!(bars[4].fill().low, 11.0);
    }

    #[test]
    fn stale_updates_are_rejected_until_resubscribed() {
        let mut c = chart(100);
        assert!(c.apply_at(&update(candle(0, 10.0, 11.0, 1.0), Some(100)), NOW));
        assert!(!c.apply_at(&update(candle(0, 10.0, 9.0, 1.0), Some(99)), NOW));
        assert_eq!(c.last_bar().unwrap().fill().close, 11.0);

        c.on_resubscribed();
        assert!(c.apply_at(&update(candle(0, 10.0, 9.0, 1.0), Some(3)), NOW));
        assert_eq!(c.last_bar().unwrap().fill().close, 9.0);
    }

    #[test]
    fn past_buckets_and_other_streams_are_ignored() {
        let mut c = chart(100);
        c.seed(vec![candle(0, 10.0, 11.0, 1.0), candle(MIN, 11.0, 12.0, 1.0)]);
        assert!(!c.apply_at(&update(candle(0, 1.0, 1.0, 1.0), None), NOW));

        let mut other = update(candle(2 * MIN, 1.0, 1.0, 1.0), None);
        other.market = "BTC-PERP".into();
        assert!(!c.apply_at(&other, NOW));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn resume_drops_backlog_and_catches_up() {
        let sequence = SequenceConfig {
            jump_threshold: 10,
            resume_debounce: Duration::from_millis(2_000),
        };
        let mut c = CandleChart::new("SOL-PERP", Resolution::OneMinute, 100, sequence);
        assert!(c.apply_at(&update(candle(0, 10.0, 11.0, 1.0), Some(100)), NOW));

        c.notify_resume_at(NOW + 10);
        // queued before the resume instant
        assert!(!c.apply_at(&update(candle(0, 10.0, 11.5, 1.0), Some(101)), NOW + 20));

        let mut live = update(candle(MIN, 11.0, 12.0, 1.0), Some(500));
        live.received_at_ms = NOW + 15;
        assert!(c.apply_at(&live, NOW + 20));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn huge_gap_creates_at_most_a_window_of_blanks() {
        let mut window = BarWindow::new(5);
        assert!(window.accumulate(candle(0, 10.0, 11.0, 1.0)));

        // 28 million buckets since the first bar
        let current = Resolution::OneMinute.bucket_start(NOW);
        assert!(window.accumulate(candle(current, 12.0, 12.5, 2.0)));

        let bars = window.bars();
        assert_eq!(bars.len(), 5);
        let starts: Vec<u64> = bars.iter().map(Candle::start).collect();
        assert_eq!(starts, (0..5).map(|i| current - (4 - i) * MIN).collect::<Vec<_>>());
        assert!(bars[..4].iter().all(|b| b.is_blank() && *b.fill() == Ohlc::flat(11.0)));
        // continues from the last real close
        assert_eq!(bars[4].fill().open, 11.0);
        assert_eq!(bars[4].fill().close, 12.5);
        assert_eq!(bars[4].base_volume(), 2.0);
    }

    #[test]
    fn window_stays_bounded() {
        let mut c = chart(5);
        for i in 0..20 {
            c.apply_at(&update(candle(i * MIN, 10.0, 10.0, 1.0), Some(i)), NOW);
        }
        assert_eq!(c.len(), 5);
        assert_eq!(c.max_bars(), 5);
        assert_eq!(c.bars()[4].start(), 19 * MIN);
    }
}
