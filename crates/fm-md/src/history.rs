//! REST candle history.
//!
//! `GET {rest}/market/{symbol}/candles/{resolution}?limit=N[&startTs=T]`
//! returns `{"success": bool, "records": [...]}` newest first. Only a single
//! page is fetched; callers wanting more issue another request with an
//! earlier `startTs`.

use fm_core::error::{FeedError, Result};
use fm_core::types::{Candle, CandlePayload, Resolution, ValidationMode};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    success: bool,
    #[serde(default)]
    records: Vec<CandlePayload>,
}

/// Decode a history response body into ascending candles.
pub fn parse_history_response(
    body: &str,
    resolution: Resolution,
    mode: ValidationMode,
) -> Result<Vec<Candle>> {
    let response: HistoryResponse = serde_json::from_str(body)?;
    if !response.success {
        return Err(FeedError::History("history request reported success=false".into()));
    }
    let mut candles = Vec::with_capacity(response.records.len());
    for record in response.records.iter().rev() {
        match Candle::from_payload(record, resolution, mode) {
            Ok(c) => candles.push(c),
            Err(e) if mode == ValidationMode::Strict => return Err(e),
            Err(e) => warn!("[history] skipping record ts={}: {e}", record.ts),
        }
    }
    candles.sort_by_key(Candle::start);
    Ok(candles)
}

pub struct HistoryClient {
    http: reqwest::Client,
    base_url: String,
    mode: ValidationMode,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>, mode: ValidationMode) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            mode,
        }
    }

    fn request(
        &self,
        symbol: &str,
        resolution: Resolution,
        limit: u32,
        start_ts: Option<u64>,
    ) -> Result<reqwest::Request> {
        let url = format!("{}/market/{symbol}/candles/{}", self.base_url, resolution.as_wire());
        let mut builder = self.http.get(&url).query(&[("limit", limit.to_string())]);
        if let Some(ts) = start_ts {
            builder = builder.query(&[("startTs", ts.to_string())]);
        }
        builder.build().map_err(|e| FeedError::History(format!("bad history request {url}: {e}")))
    }

    /// Fetch one page of candles ending at `start_ts` (epoch seconds) or now,
    /// oldest first.
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        resolution: Resolution,
        limit: u32,
        start_ts: Option<u64>,
    ) -> Result<Vec<Candle>> {
        let request = self.request(symbol, resolution, limit, start_ts)?;
        debug!("[history] GET {}", request.url());
        let body = self
            .http
            .execute(request)
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| FeedError::History(e.to_string()))?
            .text()
            .await
            .map_err(|e| FeedError::History(e.to_string()))?;
        let candles = parse_history_response(&body, resolution, self.mode)?;
        debug!("[history] {symbol} {resolution}: {} candles", candles.len());
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u64, close: f64) -> String {
        format!(
            r#"{{"ts":{ts},"fillOpen":10,"fillHigh":"12","fillLow":9,"fillClose":{close},
               "oracleOpen":10,"oracleHigh":12,"oracleLow":9,"oracleClose":{close},
               "quoteVolume":100,"baseVolume":"10"}}"#
        )
    }

    #[test]
    fn records_come_back_ascending() {
        let body = format!(
            r#"{{"success":true,"records":[{},{},{}]}}"#,
            record(1_700_000_160, 11.0),
            record(1_700_000_100, 10.5),
            record(1_700_000_040, 10.0)
        );
        let candles =
            parse_history_response(&body, Resolution::OneMinute, ValidationMode::Lenient).unwrap();
        let starts: Vec<u64> = candles.iter().map(Candle::start).collect();
        assert_eq!(starts, vec![1_700_000_040_000, 1_700_000_100_000, 1_700_000_160_000]);
        assert_eq!(candles[2].fill().close, 11.0);
        assert_eq!(candles[0].base_volume(), 10.0);
    }

    #[test]
    fn unsuccessful_response_is_an_error() {
        let parse = |body: &str| {
            parse_history_response(body, Resolution::OneMinute, ValidationMode::Lenient)
        };
        assert!(matches!(parse(r#"{"success":false}"#), Err(FeedError::History(_))));
        assert!(parse("not json").is_err());
    }

    #[test]
    fn strict_mode_rejects_bad_records() {
        let bad = r#"{"ts":1700000040,"fillOpen":10,"fillHigh":1,"fillLow":9,"fillClose":10,
                      "oracleOpen":10,"oracleHigh":12,"oracleLow":9,"oracleClose":10,
                      "quoteVolume":1,"baseVolume":1}"#;
        let body = format!(
            r#"{{"success":true,"records":[{bad},{}]}}"#,
            record(1_700_000_100, 10.0)
        );
        let res = Resolution::OneMinute;
        assert!(parse_history_response(&body, res, ValidationMode::Strict).is_err());
        // lenient clamps the high instead
        let lenient = parse_history_response(&body, res, ValidationMode::Lenient).unwrap();
        assert_eq!(lenient.len(), 2);
    }

    #[test]
    fn request_url() {
        let client = HistoryClient::new("https://data.example.com/", ValidationMode::Lenient);
        let req = client.request("SOL-PERP", Resolution::OneDay, 500, Some(1_700_000_000)).unwrap();
        assert_eq!(
            req.url().as_str(),
            "https://data.example.com/market/SOL-PERP/candles/D?limit=500&startTs=1700000000"
        );
        let req = client.request("SOL-PERP", Resolution::FiveMinutes, 10, None).unwrap();
        assert_eq!(req.url().query(), Some("limit=10"));
    }
}
