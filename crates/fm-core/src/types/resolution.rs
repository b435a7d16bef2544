//! Candle resolutions (bucket lengths).
//!
//! The upstream protocol names resolutions with TradingView-style strings
//! (`"1"`, `"60"`, `"D"`, ...). Config files and the CLI may also use the
//! human aliases (`"1m"`, `"1h"`, `"1D"`, ...).
//!
//! Every bucket has a fixed length so that bucket alignment is plain integer
//! arithmetic on epoch milliseconds. Months are treated as 30 days.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FeedError;

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Supported candle bucket lengths, ordered smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    FourHours,
    OneDay,
    OneWeek,
    OneMonth,
}

impl Resolution {
    /// All resolutions, ascending.
    pub const ALL: [Resolution; 8] = [
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
        Self::OneWeek,
        Self::OneMonth,
    ];

    /// The smallest supported resolution.
    pub const SMALLEST: Resolution = Self::OneMinute;

    /// Bucket length in milliseconds.
    #[inline]
    pub const fn bucket_ms(self) -> u64 {
        match self {
            Self::OneMinute => MINUTE_MS,
            Self::FiveMinutes => 5 * MINUTE_MS,
            Self::FifteenMinutes => 15 * MINUTE_MS,
            Self::OneHour => HOUR_MS,
            Self::FourHours => 4 * HOUR_MS,
            Self::OneDay => DAY_MS,
            Self::OneWeek => 7 * DAY_MS,
            Self::OneMonth => 30 * DAY_MS,
        }
    }

    /// Start of the bucket containing `ts_ms`.
    #[inline]
    pub const fn bucket_start(self, ts_ms: u64) -> u64 {
        let len = self.bucket_ms();
        ts_ms / len * len
    }

    /// Whether `ts_ms` sits exactly on a bucket boundary.
    #[inline]
    pub const fn is_aligned(self, ts_ms: u64) -> bool {
        ts_ms % self.bucket_ms() == 0
    }

    /// Protocol string sent in subscribe frames and REST paths.
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::OneMinute => "1",
            Self::FiveMinutes => "5",
            Self::FifteenMinutes => "15",
            Self::OneHour => "60",
            Self::FourHours => "240",
            Self::OneDay => "D",
            Self::OneWeek => "W",
            Self::OneMonth => "M",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl std::str::FromStr for Resolution {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "1M" (month) and "1m" (minute) differ only by case, so no lowercasing.
        match s.trim() {
            "1" | "1m" => Ok(Self::OneMinute),
            "5" | "5m" => Ok(Self::FiveMinutes),
            "15" | "15m" => Ok(Self::FifteenMinutes),
            "60" | "1h" | "1H" => Ok(Self::OneHour),
            "240" | "4h" | "4H" => Ok(Self::FourHours),
            "D" | "1D" | "1d" => Ok(Self::OneDay),
            "W" | "1W" | "1w" => Ok(Self::OneWeek),
            "M" | "1M" => Ok(Self::OneMonth),
            other => Err(FeedError::Config(format!("unknown resolution: {other}"))),
        }
    }
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

/// Accepts the wire string, a human alias, or a bare minute count (`60`).
impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match &raw {
            serde_json::Value::String(s) => s.parse().map_err(serde::de::Error::custom),
            serde_json::Value::Number(n) => n.to_string().parse().map_err(serde::de::Error::custom),
            other => Err(serde::de::Error::custom(format!("expected resolution, got {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_alignment() {
        let r = Resolution::FiveMinutes;
        assert_eq!(r.bucket_start(1_700_000_123_456), 1_700_000_100_000);
        assert!(r.is_aligned(1_700_000_100_000));
        assert!(!r.is_aligned(1_700_000_100_001));
    }

    #[test]
    fn parses_wire_and_aliases() {
        assert_eq!("1".parse::<Resolution>().unwrap(), Resolution::OneMinute);
        assert_eq!("1m".parse::<Resolution>().unwrap(), Resolution::OneMinute);
        assert_eq!("1M".parse::<Resolution>().unwrap(), Resolution::OneMonth);
        assert_eq!("4h".parse::<Resolution>().unwrap(), Resolution::FourHours);
        assert_eq!("D".parse::<Resolution>().unwrap(), Resolution::OneDay);
        assert!("2m".parse::<Resolution>().is_err());
    }

    #[test]
    fn ordered_smallest_first() {
        assert_eq!(Resolution::ALL.iter().min(), Some(&Resolution::SMALLEST));
        assert!(Resolution::ALL.windows(2).all(|w| w[0].bucket_ms() < w[1].bucket_ms()));
    }

    #[test]
    fn serde_uses_wire_strings() {
        let json = serde_json::to_string(&Resolution::OneHour).unwrap();
        assert_eq!(json, "\"60\"");
        let back: Resolution = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(back, Resolution::FifteenMinutes);
        let numeric: Resolution = serde_json::from_str("240").unwrap();
        assert_eq!(numeric, Resolution::FourHours);
        assert!(serde_json::from_str::<Resolution>("true").is_err());
    }
}
