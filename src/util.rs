use std::{
    any::Any,
    fmt,
    future::Future,
    ops::{Deref, DerefMut},
    pin::Pin,
    task::{Context, Poll},
};

use chrono::{DateTime, Datelike, Duration, Utc};
use tokio::task::{JoinError, JoinHandle};

use crate::shared::Timeframe;

pub(crate) trait DateTimeExt {
    /// The `"YYYY-MM"` shard key used by the chunked candle store.
    fn year_month(&self) -> String;

    /// Floors this timestamp to the start of its timeframe bucket.
    ///
    /// Uses epoch-based bucketing: `floor(timestamp / bucket_ms) * bucket_ms`.
    fn floor_to_timeframe(&self, timeframe: Timeframe) -> DateTime<Utc>;
}

impl DateTimeExt for DateTime<Utc> {
    fn year_month(&self) -> String {
        format!("{:04}-{:02}", self.year(), self.month())
    }

    fn floor_to_timeframe(&self, timeframe: Timeframe) -> DateTime<Utc> {
        let bucket_ms = timeframe.duration_ms();
        let floored_ms = (self.timestamp_millis().div_euclid(bucket_ms)) * bucket_ms;
        DateTime::from_timestamp_millis(floored_ms).expect("floored timestamp is always valid")
    }
}

/// Returns the tolerance above which an adjacent candle pair is considered a gap: `1.1 * Δ`.
pub(crate) fn gap_tolerance(timeframe: Timeframe) -> Duration {
    Duration::milliseconds(timeframe.duration_ms() + timeframe.duration_ms() / 10)
}

/// A wrapper around `tokio::task::JoinHandle` that automatically aborts the task
/// when the wrapper is dropped, while allowing access to the handle.
///
/// This is useful for ensuring that spawned tasks are cleaned up when they go out
/// of scope, preventing resource leaks.
///
/// # Important Notes
///
/// - When dropped, this calls `abort()` on the task, which does **not** run destructors
///   or cleanup code. Tasks should be designed to handle abrupt cancellation.
/// - Implements `Deref` and `DerefMut` for transparent access to `JoinHandle` methods
/// - Implements `Future` so it can be awaited just like a regular `JoinHandle`
#[derive(Debug)]
pub(crate) struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> From<JoinHandle<T>> for AbortOnDropHandle<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Deref for AbortOnDropHandle<T> {
    type Target = JoinHandle<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for AbortOnDropHandle<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> Future for AbortOnDropHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
pub struct PanicPayload(String);

impl From<Box<dyn Any + Send>> for PanicPayload {
    fn from(value: Box<dyn Any + Send>) -> Self {
        let panic_msg = if let Some(s) = value.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = value.downcast_ref::<&str>() {
            s.to_string()
        } else {
            "unknown panic payload".to_string()
        };

        Self(panic_msg)
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    mod year_month {
        use super::*;

        #[test]
        fn formats_with_leading_zero_month() {
            let time = Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap();
            assert_eq!(time.year_month(), "2026-03");
        }

        #[test]
        fn december_stays_in_year() {
            let time = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 0).unwrap();
            assert_eq!(time.year_month(), "2026-12");
        }
    }

    mod floor_to_timeframe {
        use super::*;

        #[test]
        fn one_hour_floors_correctly() {
            let time = Utc.with_ymd_and_hms(2026, 1, 15, 10, 35, 0).unwrap();
            let result = time.floor_to_timeframe(Timeframe::OneHour);
            assert_eq!(result, Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        }

        #[test]
        fn fifteen_minutes_floors_correctly() {
            let time = Utc.with_ymd_and_hms(2026, 1, 15, 10, 44, 0).unwrap();
            let result = time.floor_to_timeframe(Timeframe::FifteenMinutes);
            assert_eq!(
                result,
                Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap()
            );
        }

        #[test]
        fn one_day_floors_to_midnight() {
            let time = Utc.with_ymd_and_hms(2026, 1, 15, 14, 30, 0).unwrap();
            let result = time.floor_to_timeframe(Timeframe::OneDay);
            assert_eq!(result, Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap());
        }
    }

    mod gap_tolerance_fn {
        use super::*;

        #[test]
        fn is_one_point_one_times_duration() {
            let tolerance = gap_tolerance(Timeframe::OneHour);
            assert_eq!(tolerance, Duration::milliseconds(3_960_000));
        }
    }
}
