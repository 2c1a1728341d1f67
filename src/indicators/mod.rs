//! Dynamic indicator dispatch.
//!
//! Mirrors the design note in `SPEC_FULL.md` §9: the indicator set is a tagged variant rather
//! than a flat config record, and [`calculate`] dispatches over a `&[Indicator]` list instead of
//! branching on a pile of booleans. The concrete math is intentionally small (SMA/EMA/RSI/MACD
//! via the `ta` crate) — the calculator is an external collaborator per `spec.md` §1, so the
//! dispatch shape is the part of this module the core actually depends on.

use serde::{Deserialize, Serialize};
use ta::{Next, indicators as ta_indicators};

use crate::db::models::Candle;

pub mod error;

use error::IndicatorError;

/// One configured technical indicator, tagged by variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Indicator {
    Sma { periods: Vec<usize> },
    Ema { periods: Vec<usize> },
    Rsi { period: usize },
    Macd { fast: usize, slow: usize, signal: usize },
}

impl Indicator {
    fn output_key(&self, period_or: usize) -> String {
        match self {
            Self::Sma { .. } => format!("sma_{period_or}"),
            Self::Ema { .. } => format!("ema_{period_or}"),
            Self::Rsi { .. } => format!("rsi_{period_or}"),
            Self::Macd { .. } => "macd".to_string(),
        }
    }
}

/// Effective indicator config resolution: `job.config ∨ connector.config ∨ builtin_defaults`.
pub fn effective_config<'a>(
    job_config: Option<&'a [Indicator]>,
    connector_config: Option<&'a [Indicator]>,
    builtin_defaults: &'a [Indicator],
) -> &'a [Indicator] {
    job_config
        .or(connector_config)
        .unwrap_or(builtin_defaults)
}

/// Built-in defaults applied when neither the job nor the connector override them.
pub fn builtin_defaults() -> Vec<Indicator> {
    vec![
        Indicator::Sma { periods: vec![20, 50] },
        Indicator::Ema { periods: vec![12, 26] },
        Indicator::Rsi { period: 14 },
    ]
}

/// Annotates `candles` (ascending by time) with the configured indicators, in place.
///
/// A pure function `Candles -> Candles` per `spec.md` §1: it never touches storage or the
/// network, and indicator failure (a malformed period, too little history) is non-fatal to the
/// caller — the Executor logs it and continues with the raw candles (`spec.md` §4.5 step 5).
pub fn calculate(candles: &mut [Candle], indicators: &[Indicator]) -> Result<(), IndicatorError> {
    for indicator in indicators {
        apply_one(candles, indicator)?;
    }
    Ok(())
}

fn apply_one(candles: &mut [Candle], indicator: &Indicator) -> Result<(), IndicatorError> {
    match indicator {
        Indicator::Sma { periods } => {
            for &period in periods {
                apply_sma(candles, period)?;
            }
        }
        Indicator::Ema { periods } => {
            for &period in periods {
                apply_ema(candles, period)?;
            }
        }
        Indicator::Rsi { period } => apply_rsi(candles, *period)?,
        Indicator::Macd { fast, slow, signal } => apply_macd(candles, *fast, *slow, *signal)?,
    }
    Ok(())
}

fn insert(candle: &mut Candle, key: String, value: f64) {
    let map = candle
        .indicators
        .get_or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(map) = map {
        map.insert(key, serde_json::json!(value));
    }
}

fn apply_sma(candles: &mut [Candle], period: usize) -> Result<(), IndicatorError> {
    let mut sma = ta_indicators::SimpleMovingAverage::new(period)
        .map_err(|e| IndicatorError::Configuration(e.to_string()))?;
    let key = Indicator::Sma { periods: vec![period] }.output_key(period);
    for candle in candles.iter_mut() {
        let value = sma.next(candle.close);
        insert(candle, key.clone(), value);
    }
    Ok(())
}

fn apply_ema(candles: &mut [Candle], period: usize) -> Result<(), IndicatorError> {
    let mut ema = ta_indicators::ExponentialMovingAverage::new(period)
        .map_err(|e| IndicatorError::Configuration(e.to_string()))?;
    let key = Indicator::Ema { periods: vec![period] }.output_key(period);
    for candle in candles.iter_mut() {
        let value = ema.next(candle.close);
        insert(candle, key.clone(), value);
    }
    Ok(())
}

fn apply_rsi(candles: &mut [Candle], period: usize) -> Result<(), IndicatorError> {
    let mut rsi = ta_indicators::RelativeStrengthIndex::new(period)
        .map_err(|e| IndicatorError::Configuration(e.to_string()))?;
    let key = Indicator::Rsi { period }.output_key(period);
    for candle in candles.iter_mut() {
        let value = rsi.next(candle.close);
        insert(candle, key.clone(), value);
    }
    Ok(())
}

fn apply_macd(
    candles: &mut [Candle],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Result<(), IndicatorError> {
    let mut macd = ta_indicators::MovingAverageConvergenceDivergence::new(fast, slow, signal)
        .map_err(|e| IndicatorError::Configuration(e.to_string()))?;
    for candle in candles.iter_mut() {
        let output = macd.next(candle.close);
        let map = candle
            .indicators
            .get_or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let serde_json::Value::Object(map) = map {
            map.insert("macd".to_string(), serde_json::json!(output.macd));
            map.insert("macd_signal".to_string(), serde_json::json!(output.signal));
            map.insert(
                "macd_histogram".to_string(),
                serde_json::json!(output.histogram),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            timestamp_ms: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap().timestamp_millis()
                + i * 60_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            indicators: None,
        }
    }

    #[test]
    fn sma_annotates_every_candle() {
        let mut candles: Vec<Candle> = (0..5).map(|i| candle(i, 100.0 + i as f64)).collect();
        calculate(&mut candles, &[Indicator::Sma { periods: vec![3] }]).unwrap();

        for c in &candles {
            assert!(c.indicators.as_ref().unwrap().get("sma_3").is_some());
        }
    }

    #[test]
    fn effective_config_prefers_job_then_connector_then_builtin() {
        let job = vec![Indicator::Rsi { period: 7 }];
        let connector = vec![Indicator::Rsi { period: 21 }];
        let builtin = builtin_defaults();

        assert_eq!(
            effective_config(Some(&job), Some(&connector), &builtin),
            &job[..]
        );
        assert_eq!(
            effective_config(None, Some(&connector), &builtin),
            &connector[..]
        );
        assert_eq!(effective_config(None, None, &builtin), &builtin[..]);
    }

    #[test]
    fn indicator_failure_is_non_fatal_style_reported_as_error() {
        let mut candles: Vec<Candle> = (0..2).map(|i| candle(i, 100.0)).collect();
        let result = calculate(&mut candles, &[Indicator::Sma { periods: vec![0] }]);
        assert!(result.is_err());
    }
}
