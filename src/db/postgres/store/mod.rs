use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::db::error::{DbError, Result};
use crate::db::models::{AggregatedDocument, Candle, Gap, Stats};
use crate::db::repositories::StoreRepository;
use crate::shared::{Freshness, Timeframe};
use crate::util::DateTimeExt;

pub(crate) mod quality;

const MAX_SERIALIZATION_RETRIES: u32 = 5;

pub(crate) struct PgStoreRepo {
    pool: Arc<Pool<Postgres>>,
}

impl PgStoreRepo {
    pub fn new(pool: Arc<Pool<Postgres>>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &Pool<Postgres> {
        self.pool.as_ref()
    }
}

/// Merges `incoming` into `existing`, deduplicating by `timestamp_ms`. On a timestamp
/// collision the existing candle wins and the incoming one is dropped untouched (`E ∪
/// uniqueN`): once a bar is stored, only a genuinely new timestamp can add to it. Returns the
/// merged set sorted descending and the count of genuinely new candles.
pub(crate) fn merge_candles(existing: Vec<Candle>, incoming: Vec<Candle>) -> (Vec<Candle>, usize) {
    use std::collections::BTreeMap;

    let mut by_ts: BTreeMap<i64, Candle> = BTreeMap::new();
    for candle in existing {
        by_ts.insert(candle.timestamp_ms, candle);
    }

    let mut new_count = 0;
    for candle in incoming {
        if let std::collections::btree_map::Entry::Vacant(slot) = by_ts.entry(candle.timestamp_ms) {
            slot.insert(candle);
            new_count += 1;
        }
    }

    let merged = by_ts.into_values().rev().collect();
    (merged, new_count)
}

/// Detects gaps in an ascending-by-time candle slice: any adjacent pair spaced further apart
/// than [`crate::util::gap_tolerance`] for `timeframe`.
pub(crate) fn detect_gaps(candles_ascending: &[Candle], timeframe: Timeframe) -> Vec<Gap> {
    let tolerance_ms = crate::util::gap_tolerance(timeframe).num_milliseconds();
    candles_ascending
        .windows(2)
        .filter_map(|pair| {
            let delta = pair[1].timestamp_ms - pair[0].timestamp_ms;
            if delta > tolerance_ms {
                Some(Gap { start_ms: pair[0].timestamp_ms, end_ms: pair[1].timestamp_ms })
            } else {
                None
            }
        })
        .collect()
}

fn months_in_range(start_ms: i64, end_ms: i64) -> Vec<String> {
    let start = DateTime::from_timestamp_millis(start_ms).expect("valid range start");
    let end = DateTime::from_timestamp_millis(end_ms).expect("valid range end");

    let mut months = Vec::new();
    let mut cursor = start;
    loop {
        months.push(cursor.year_month());
        let next_month_start = if cursor.month() == 12 {
            chrono::Utc.with_ymd_and_hms(cursor.year() + 1, 1, 1, 0, 0, 0).unwrap()
        } else {
            chrono::Utc.with_ymd_and_hms(cursor.year(), cursor.month() + 1, 1, 0, 0, 0).unwrap()
        };
        if next_month_start > end {
            break;
        }
        cursor = next_month_start;
    }
    months
}

#[async_trait]
impl StoreRepository for PgStoreRepo {
    async fn upsert_candles(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let timeframe_str = timeframe.to_string();
        let mut by_month: std::collections::BTreeMap<String, Vec<Candle>> = Default::default();
        for candle in candles {
            let ts = DateTime::from_timestamp_millis(candle.timestamp_ms)
                .expect("candle timestamp is always valid");
            by_month.entry(ts.year_month()).or_default().push(candle);
        }

        let mut total_new = 0;
        for (year_month, incoming) in by_month {
            total_new += self
                .upsert_month_chunk(exchange_id, symbol, &timeframe_str, &year_month, incoming)
                .await?;
        }
        Ok(total_new)
    }

    async fn get_range(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<AggregatedDocument> {
        let timeframe_str = timeframe.to_string();
        let months = months_in_range(start_ms, end_ms);

        let mut candles = Vec::new();
        for year_month in &months {
            let row: Option<(sqlx::types::Json<Vec<Candle>>,)> = sqlx::query_as(
                "SELECT candles FROM ohlcv_chunks \
                 WHERE exchange_id = $1 AND symbol = $2 AND timeframe = $3 AND year_month = $4",
            )
            .bind(exchange_id)
            .bind(symbol)
            .bind(&timeframe_str)
            .bind(year_month)
            .fetch_optional(self.pool())
            .await?;

            if let Some((chunk_candles,)) = row {
                candles.extend(chunk_candles.0.into_iter().filter(|c| {
                    c.timestamp_ms >= start_ms && c.timestamp_ms < end_ms
                }));
            }
        }

        candles.sort_by_key(|c| c.timestamp_ms);
        let gaps = detect_gaps(&candles, timeframe);
        let expected_bars = (end_ms - start_ms) / timeframe.duration_ms();
        let missing_bars: i64 = gaps.iter().map(|g| g.missing_bars(timeframe)).sum();
        let freshness = freshness_of(candles.last().map(|c| c.timestamp_ms), timeframe);
        let quality = quality::classify(candles.len() as i64, expected_bars, gaps.len(), missing_bars, freshness);

        Ok(AggregatedDocument {
            exchange_id: exchange_id.to_string(),
            symbol: symbol.to_string(),
            timeframe,
            candles,
            gaps,
            freshness,
            quality,
        })
    }

    async fn newest_timestamp(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<i64>> {
        Ok(self.get_last_candle(exchange_id, symbol, timeframe).await?.map(|c| c.timestamp_ms))
    }

    async fn get_last_candle(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>> {
        let timeframe_str = timeframe.to_string();
        let row: Option<(sqlx::types::Json<Vec<Candle>>,)> = sqlx::query_as(
            "SELECT candles FROM ohlcv_chunks \
             WHERE exchange_id = $1 AND symbol = $2 AND timeframe = $3 \
             ORDER BY year_month DESC LIMIT 1",
        )
        .bind(exchange_id)
        .bind(symbol)
        .bind(&timeframe_str)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.and_then(|(candles,)| candles.0.into_iter().next()))
    }

    async fn get_recent_candles(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let timeframe_str = timeframe.to_string();
        let rows: Vec<(sqlx::types::Json<Vec<Candle>>,)> = sqlx::query_as(
            "SELECT candles FROM ohlcv_chunks \
             WHERE exchange_id = $1 AND symbol = $2 AND timeframe = $3 \
             ORDER BY year_month DESC",
        )
        .bind(exchange_id)
        .bind(symbol)
        .bind(&timeframe_str)
        .fetch_all(self.pool())
        .await?;

        let mut collected = Vec::with_capacity(limit);
        'chunks: for (chunk,) in rows {
            for candle in chunk.0 {
                collected.push(candle);
                if collected.len() >= limit {
                    break 'chunks;
                }
            }
        }
        collected.sort_by_key(|c| c.timestamp_ms);
        Ok(collected)
    }

    async fn find_with_pagination(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        cursor_ms: Option<i64>,
        limit: usize,
    ) -> Result<(Vec<Candle>, Option<i64>)> {
        let timeframe_str = timeframe.to_string();
        let rows: Vec<(sqlx::types::Json<Vec<Candle>>,)> = sqlx::query_as(
            "SELECT candles FROM ohlcv_chunks \
             WHERE exchange_id = $1 AND symbol = $2 AND timeframe = $3 \
             ORDER BY year_month ASC",
        )
        .bind(exchange_id)
        .bind(symbol)
        .bind(&timeframe_str)
        .fetch_all(self.pool())
        .await?;

        let mut candles: Vec<Candle> = rows.into_iter().flat_map(|(c,)| c.0).collect();
        candles.sort_by_key(|c| c.timestamp_ms);

        let start_ms = cursor_ms.unwrap_or(i64::MIN);
        let mut page: Vec<Candle> =
            candles.into_iter().filter(|c| c.timestamp_ms >= start_ms).take(limit + 1).collect();

        let next_cursor = if page.len() > limit {
            page.pop();
            page.last().map(|c| c.timestamp_ms + 1)
        } else {
            None
        };

        Ok((page, next_cursor))
    }

    async fn count(&self, exchange_id: &str, symbol: &str, timeframe: Timeframe) -> Result<i64> {
        let timeframe_str = timeframe.to_string();
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(candles_count), 0) FROM ohlcv_chunks \
             WHERE exchange_id = $1 AND symbol = $2 AND timeframe = $3",
        )
        .bind(exchange_id)
        .bind(symbol)
        .bind(&timeframe_str)
        .fetch_one(self.pool())
        .await?;

        Ok(row.0)
    }

    async fn delete_by_job(&self, exchange_id: &str, symbol: &str, timeframe: Timeframe) -> Result<u64> {
        let timeframe_str = timeframe.to_string();
        let result = sqlx::query(
            "DELETE FROM ohlcv_chunks WHERE exchange_id = $1 AND symbol = $2 AND timeframe = $3",
        )
        .bind(exchange_id)
        .bind(symbol)
        .bind(&timeframe_str)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_stats(&self, exchange_id: &str, symbol: &str, timeframe: Timeframe) -> Result<Stats> {
        let timeframe_str = timeframe.to_string();
        let rows: Vec<(sqlx::types::Json<Vec<Candle>>,)> = sqlx::query_as(
            "SELECT candles FROM ohlcv_chunks \
             WHERE exchange_id = $1 AND symbol = $2 AND timeframe = $3 \
             ORDER BY year_month ASC",
        )
        .bind(exchange_id)
        .bind(symbol)
        .bind(&timeframe_str)
        .fetch_all(self.pool())
        .await?;

        let mut candles: Vec<Candle> = rows.into_iter().flat_map(|(c,)| c.0).collect();
        candles.sort_by_key(|c| c.timestamp_ms);

        let oldest_ms = candles.first().map(|c| c.timestamp_ms);
        let newest_ms = candles.last().map(|c| c.timestamp_ms);
        let gaps = detect_gaps(&candles, timeframe);
        let expected_bars = match (oldest_ms, newest_ms) {
            (Some(o), Some(n)) => (n - o) / timeframe.duration_ms(),
            _ => 0,
        };
        let missing_bars: i64 = gaps.iter().map(|g| g.missing_bars(timeframe)).sum();
        let freshness = freshness_of(newest_ms, timeframe);
        let quality = quality::classify(candles.len() as i64, expected_bars, gaps.len(), missing_bars, freshness);

        Ok(Stats {
            exchange_id: exchange_id.to_string(),
            symbol: symbol.to_string(),
            timeframe,
            candle_count: candles.len() as i64,
            oldest_ms,
            newest_ms,
            gap_count: gaps.len(),
            freshness,
            quality,
        })
    }

    async fn get_stats_by_exchange(&self, exchange_id: &str) -> Result<Vec<Stats>> {
        let triples: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT symbol, timeframe FROM ohlcv_chunks WHERE exchange_id = $1",
        )
        .bind(exchange_id)
        .fetch_all(self.pool())
        .await?;

        let mut stats = Vec::with_capacity(triples.len());
        for (symbol, timeframe_str) in triples {
            let timeframe = timeframe_str.parse().map_err(DbError::InvalidTimeframe)?;
            stats.push(self.get_stats(exchange_id, &symbol, timeframe).await?);
        }
        Ok(stats)
    }

    async fn get_all_stats(&self) -> Result<Vec<Stats>> {
        let triples: Vec<(String, String, String)> =
            sqlx::query_as("SELECT DISTINCT exchange_id, symbol, timeframe FROM ohlcv_chunks")
                .fetch_all(self.pool())
                .await?;

        let mut stats = Vec::with_capacity(triples.len());
        for (exchange_id, symbol, timeframe_str) in triples {
            let timeframe = timeframe_str.parse().map_err(DbError::InvalidTimeframe)?;
            stats.push(self.get_stats(&exchange_id, &symbol, timeframe).await?);
        }
        Ok(stats)
    }
}

/// Freshness of a series given its newest candle's timestamp, relative to now.
fn freshness_of(newest_ms: Option<i64>, timeframe: Timeframe) -> Freshness {
    match newest_ms {
        Some(ts) => {
            let minutes_since = (Utc::now().timestamp_millis() - ts) / 60_000;
            Freshness::classify(minutes_since, timeframe)
        }
        None => Freshness::VeryStale,
    }
}

impl PgStoreRepo {
    async fn upsert_month_chunk(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe_str: &str,
        year_month: &str,
        incoming: Vec<Candle>,
    ) -> Result<usize> {
        for attempt in 0..MAX_SERIALIZATION_RETRIES {
            let mut tx = self.pool().begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;

            let existing_row: Option<(sqlx::types::Json<Vec<Candle>>,)> = sqlx::query_as(
                "SELECT candles FROM ohlcv_chunks \
                 WHERE exchange_id = $1 AND symbol = $2 AND timeframe = $3 AND year_month = $4 \
                 FOR UPDATE",
            )
            .bind(exchange_id)
            .bind(symbol)
            .bind(timeframe_str)
            .bind(year_month)
            .fetch_optional(&mut *tx)
            .await?;

            let existing = existing_row.map(|(c,)| c.0).unwrap_or_default();
            let (merged, new_count) = merge_candles(existing, incoming.clone());

            let start_ms = merged.last().map(|c| c.timestamp_ms).unwrap_or(0);
            let end_ms = merged.first().map(|c| c.timestamp_ms).unwrap_or(0);
            let start_time = DateTime::from_timestamp_millis(start_ms).unwrap_or(Utc::now());
            let end_time = DateTime::from_timestamp_millis(end_ms).unwrap_or(Utc::now());

            let result = sqlx::query(
                "INSERT INTO ohlcv_chunks \
                    (id, exchange_id, symbol, timeframe, year_month, start_time, end_time, \
                     candles_count, candles, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now()) \
                 ON CONFLICT (exchange_id, symbol, timeframe, year_month) \
                 DO UPDATE SET \
                    start_time = EXCLUDED.start_time, \
                    end_time = EXCLUDED.end_time, \
                    candles_count = EXCLUDED.candles_count, \
                    candles = EXCLUDED.candles, \
                    updated_at = now()",
            )
            .bind(Uuid::new_v4())
            .bind(exchange_id)
            .bind(symbol)
            .bind(timeframe_str)
            .bind(year_month)
            .bind(start_time)
            .bind(end_time)
            .bind(merged.len() as i32)
            .bind(sqlx::types::Json(&merged))
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {
                    tx.commit().await?;
                    return Ok(new_count);
                }
                Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("40001") => {
                    tx.rollback().await.ok();
                    tracing::warn!(exchange_id, symbol, year_month, attempt, "chunk write serialization conflict, retrying");
                    continue;
                }
                Err(e) => return Err(DbError::from(e)),
            }
        }

        Err(DbError::ChunkWriteConflict {
            exchange_id: exchange_id.to_string(),
            symbol: symbol.to_string(),
            timeframe: timeframe_str.to_string(),
            year_month: year_month.to_string(),
            attempts: MAX_SERIALIZATION_RETRIES,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64) -> Candle {
        Candle { timestamp_ms: ts, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0, indicators: None }
    }

    #[test]
    fn merge_dedupes_by_timestamp_and_keeps_existing() {
        let existing = vec![candle(1000)];
        let mut incoming_candle = candle(1000);
        incoming_candle.close = 2.0;
        let (merged, new_count) = merge_candles(existing, vec![incoming_candle, candle(2000)]);

        assert_eq!(new_count, 1);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].timestamp_ms, 2000);
        assert_eq!(merged[1].close, 1.0);
    }

    #[test]
    fn detect_gaps_finds_hole_beyond_tolerance() {
        let candles = vec![candle(0), candle(Timeframe::OneHour.duration_ms() * 3)];
        let gaps = detect_gaps(&candles, Timeframe::OneHour);
        assert_eq!(gaps.len(), 1);
    }

    #[test]
    fn detect_gaps_ignores_contiguous_candles() {
        let candles = vec![candle(0), candle(Timeframe::OneHour.duration_ms())];
        let gaps = detect_gaps(&candles, Timeframe::OneHour);
        assert!(gaps.is_empty());
    }

    #[test]
    fn months_in_range_spans_calendar_boundary() {
        let start = chrono::Utc.with_ymd_and_hms(2026, 1, 20, 0, 0, 0).unwrap().timestamp_millis();
        let end = chrono::Utc.with_ymd_and_hms(2026, 2, 5, 0, 0, 0).unwrap().timestamp_millis();
        let months = months_in_range(start, end);
        assert_eq!(months, vec!["2026-01".to_string(), "2026-02".to_string()]);
    }
}
