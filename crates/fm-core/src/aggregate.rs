//! Candle aggregation: merging fragments into buckets, stitching series and
//! filling gaps for chart rendering.
//!
//! # Merge rules
//!
//! [`merge`] combines a `current` candle with the `previous` state it builds
//! on. Buckets are compared at `current`'s resolution:
//!
//! | previous bucket | open             | high / low                         | volumes      |
//! |-----------------|------------------|------------------------------------|--------------|
//! | earlier         | `previous.close` | current extremes widened to open   | current only |
//! | same            | `previous.open`  | extremes across both candles       | summed       |
//! | later / none    | `current.open`   | current                            | current only |
//!
//! The earlier-bucket row is the continuation rule: a new bucket opens where
//! the prior one closed. Fill and oracle series are merged independently.

use std::cmp::Ordering;

use crate::error::{FeedError, Result};
use crate::types::{Candle, Ohlc, Resolution};

/// Merge `current` onto `previous`. See the module docs for the rules.
pub fn merge(current: &Candle, previous: Option<&Candle>) -> Candle {
    let Some(prev) = previous else {
        return *current;
    };

    let res = current.resolution;
    let bucket = res.bucket_start(current.start);

    match res.bucket_start(prev.start).cmp(&bucket) {
        Ordering::Less => Candle {
            start: bucket,
            resolution: res,
            fill: continue_series(&current.fill, &prev.fill),
            oracle: continue_series(&current.oracle, &prev.oracle),
            quote_volume: current.quote_volume,
            base_volume: current.base_volume,
        },
        Ordering::Equal => Candle {
            start: bucket,
            resolution: res,
            fill: combine_series(&current.fill, &prev.fill),
            oracle: combine_series(&current.oracle, &prev.oracle),
            quote_volume: current.quote_volume + prev.quote_volume,
            base_volume: current.base_volume + prev.base_volume,
        },
        Ordering::Greater => *current,
    }
}

fn continue_series(current: &Ohlc, previous: &Ohlc) -> Ohlc {
    let open = previous.close;
    Ohlc {
        open,
        high: current.high.max(open),
        low: current.low.min(open),
        close: current.close,
    }
}

fn combine_series(current: &Ohlc, previous: &Ohlc) -> Ohlc {
    Ohlc {
        open: previous.open,
        high: current.high.max(previous.high),
        low: current.low.min(previous.low),
        close: current.close,
    }
}

/// Left fold of [`merge`] over `candles` in chronological order.
///
/// Fails on an empty slice.
pub fn merge_all(candles: &[Candle]) -> Result<Candle> {
    let sorted = sorted_by_start(candles);
    let (first, rest) = sorted
        .split_first()
        .ok_or_else(|| FeedError::InvalidCandle("cannot merge an empty candle list".into()))?;

    Ok(rest.iter().fold(*first, |acc, c| merge(c, Some(&acc))))
}

/// Chain independently built candles so every bucket opens at the prior
/// bucket's close. Candles sharing a bucket are folded together.
pub fn stitch_candles(candles: &[Candle]) -> Vec<Candle> {
    let mut stitched: Vec<Candle> = Vec::with_capacity(candles.len());
    for c in sorted_by_start(candles) {
        match stitched.last_mut() {
            Some(last) if same_bucket(last, &c) => {
                *last = merge(&c, Some(last));
            }
            Some(last) => {
                let next = merge(&c, Some(last));
                stitched.push(next);
            }
            None => stitched.push(c),
        }
    }
    stitched
}

/// Insert flat zero-volume candles for every missing bucket between adjacent
/// candles of a time-ordered series.
pub fn fill_gaps(candles: &[Candle], resolution: Resolution) -> Vec<Candle> {
    let step = resolution.bucket_ms();
    let mut out = Vec::with_capacity(candles.len());

    for (i, c) in candles.iter().enumerate() {
        if i > 0 {
            let prev = candles[i - 1];
            let mut t = prev.start + step;
            while t < c.start {
                out.push(Candle::blank(t, &prev));
                t += step;
            }
        }
        out.push(*c);
    }
    out
}

/// Blank candles covering every bucket after `last` up to and including the
/// bucket that contains `until_ms`.
pub fn blanks_until(last: &Candle, until_ms: u64) -> Vec<Candle> {
    let step = last.resolution.bucket_ms();
    let end = last.resolution.bucket_start(until_ms);
    let mut out = Vec::new();
    let mut t = last.start + step;
    while t <= end {
        out.push(Candle::blank(t, last));
        t += step;
    }
    out
}

/// Merge candles of a smaller resolution into `target` buckets.
///
/// Every input must have a resolution no larger than `target`. The result is
/// stitched, so each target bucket continues from the previous one.
pub fn rebucket(candles: &[Candle], target: Resolution) -> Result<Vec<Candle>> {
    if let Some(c) = candles.iter().find(|c| c.resolution > target) {
        return Err(FeedError::InvalidCandle(format!(
            "cannot rebucket {} candles into smaller {} buckets",
            c.resolution, target
        )));
    }

    let mut buckets: Vec<Candle> = Vec::new();
    let mut group: Vec<Candle> = Vec::new();

    for c in sorted_by_start(candles) {
        let restamped = Candle {
            start: target.bucket_start(c.start),
            resolution: target,
            ..c
        };
        if group.first().is_some_and(|g| g.start != restamped.start) {
            buckets.push(merge_all(&group)?);
            group.clear();
        }
        group.push(restamped);
    }
    if !group.is_empty() {
        buckets.push(merge_all(&group)?);
    }

    Ok(stitch_candles(&buckets))
}

fn same_bucket(a: &Candle, b: &Candle) -> bool {
    a.resolution.bucket_start(a.start) == b.resolution.bucket_start(b.start)
}

fn sorted_by_start(candles: &[Candle]) -> Vec<Candle> {
    let mut sorted = candles.to_vec();
    sorted.sort_by_key(|c| c.start);
    sorted
}
