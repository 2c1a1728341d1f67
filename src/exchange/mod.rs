//! Exchange client boundary.
//!
//! `ExchangeClient` is injected into the Executor behind `Arc<dyn ExchangeClient>`, the same
//! way the teacher treats `lnm_sdk::RestClient` as an external collaborator. Concrete exchange
//! API clients are out of scope (`spec.md` §1 Non-goals); this module only defines the trait
//! boundary, the date-range-too-wide detector, and an in-memory mock for tests.

use async_trait::async_trait;

use crate::db::models::Candle;
use crate::shared::Timeframe;

pub mod error;

use error::Result;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Lists the symbols this exchange currently trades. Called by deployments to validate a
    /// job's `symbol` before registering it; this crate itself only uses it as a capability
    /// probe ahead of the first fetch for a connector.
    async fn load_markets(&self) -> Result<Vec<String>>;

    /// The largest `limit` this exchange will honor in one `fetch_ohlcv` call for
    /// `exchange_id`. The Executor's paginated fetch loop never requests more than this.
    async fn max_batch_limit(&self, exchange_id: &str) -> Result<u32>;

    /// Fetches up to `limit` candles at or after `since_ms`, oldest-first or any order — the
    /// Executor sorts them. A page shorter than `limit` signals the series is exhausted at
    /// the requesting end (no more candles after it, for now).
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>>;
}

/// Matches the family of error phrases exchanges use to reject an overly wide historical
/// request, the trigger for the Executor's historical-window fallback sequence
/// (`SPEC_FULL.md` §6 `HISTORICAL_WINDOW_FALLBACK_MONTHS`).
pub fn is_date_range_too_wide(message: &str) -> bool {
    const PHRASES: [&str; 5] = [
        "date range too wide",
        "range too large",
        "maximum range exceeded",
        "too many candles requested",
        "too far in the past",
    ];
    let lower = message.to_lowercase();
    PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// In-memory `ExchangeClient` used by Executor/Scheduler tests. Serves candles from a fixed
/// set, synthesizing the "too far in the past" error for a `since_ms` older than
/// `earliest_allowed_ms`.
pub struct MockExchangeClient {
    pub candles: Vec<Candle>,
    pub earliest_allowed_ms: Option<i64>,
    pub max_batch_limit: u32,
    pub markets: Vec<String>,
}

impl MockExchangeClient {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles, earliest_allowed_ms: None, max_batch_limit: 500, markets: Vec::new() }
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    async fn load_markets(&self) -> Result<Vec<String>> {
        Ok(self.markets.clone())
    }

    async fn max_batch_limit(&self, _exchange_id: &str) -> Result<u32> {
        Ok(self.max_batch_limit)
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        if let Some(earliest) = self.earliest_allowed_ms {
            if since_ms < earliest {
                return Err(error::ExchangeError::Fatal(
                    "requested candles too far in the past for this connector".to_string(),
                ));
            }
        }

        let mut matched: Vec<Candle> = self
            .candles
            .iter()
            .filter(|c| c.timestamp_ms >= since_ms)
            .cloned()
            .collect();
        matched.sort_by_key(|c| c.timestamp_ms);
        matched.truncate(limit as usize);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_too_wide_phrases() {
        assert!(is_date_range_too_wide("Error: Date Range Too Wide for this symbol"));
        assert!(is_date_range_too_wide("maximum range exceeded (max 30d)"));
        assert!(!is_date_range_too_wide("connection reset by peer"));
    }

    #[tokio::test]
    async fn mock_client_rejects_since_before_earliest_allowed() {
        let mut client = MockExchangeClient::new(Vec::new());
        client.earliest_allowed_ms = Some(1000);
        let result = client.fetch_ohlcv("BTC-USD", Timeframe::OneMinute, 0, 10).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mock_client_paginates_by_since_and_limit() {
        let candles = vec![
            Candle { timestamp_ms: 0, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0, indicators: None },
            Candle { timestamp_ms: 100, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0, indicators: None },
            Candle { timestamp_ms: 200, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0, indicators: None },
        ];
        let client = MockExchangeClient::new(candles);
        let first_page = client.fetch_ohlcv("BTC-USD", Timeframe::OneMinute, 0, 2).await.unwrap();
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[1].timestamp_ms, 100);

        let next_since = first_page.last().unwrap().timestamp_ms + 1;
        let second_page = client.fetch_ohlcv("BTC-USD", Timeframe::OneMinute, next_since, 2).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].timestamp_ms, 200);
    }
}
