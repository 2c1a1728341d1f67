use std::fmt;

use strum::{Display, EnumString};

pub mod error;

/// Candle bar duration supported by the store and the scheduler.
///
/// Durations are exact in milliseconds except [`Timeframe::OneMonth`], which uses the
/// approximate 30-day value for all duration arithmetic (cursor advance, gap tolerance,
/// next-run scheduling). Storage month-bucketing always uses calendar months regardless
/// of timeframe.
#[derive(Debug, Display, EnumString, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    #[strum(serialize = "1m")]
    OneMinute,
    #[strum(serialize = "3m")]
    ThreeMinutes,
    #[strum(serialize = "5m")]
    FiveMinutes,
    #[strum(serialize = "15m")]
    FifteenMinutes,
    #[strum(serialize = "30m")]
    ThirtyMinutes,
    #[strum(serialize = "1h")]
    OneHour,
    #[strum(serialize = "2h")]
    TwoHours,
    #[strum(serialize = "4h")]
    FourHours,
    #[strum(serialize = "6h")]
    SixHours,
    #[strum(serialize = "8h")]
    EightHours,
    #[strum(serialize = "12h")]
    TwelveHours,
    #[strum(serialize = "1d")]
    OneDay,
    #[strum(serialize = "3d")]
    ThreeDays,
    #[strum(serialize = "1w")]
    OneWeek,
    #[strum(serialize = "1M")]
    OneMonth,
}

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

impl Timeframe {
    /// All supported timeframes, shortest first.
    pub const ALL: [Timeframe; 15] = [
        Self::OneMinute,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::TwoHours,
        Self::FourHours,
        Self::SixHours,
        Self::EightHours,
        Self::TwelveHours,
        Self::OneDay,
        Self::ThreeDays,
        Self::OneWeek,
        Self::OneMonth,
    ];

    /// The bar duration in milliseconds. `OneMonth` is the approximate `30 * 24h` value.
    pub const fn duration_ms(&self) -> i64 {
        match self {
            Self::OneMinute => MINUTE_MS,
            Self::ThreeMinutes => 3 * MINUTE_MS,
            Self::FiveMinutes => 5 * MINUTE_MS,
            Self::FifteenMinutes => 15 * MINUTE_MS,
            Self::ThirtyMinutes => 30 * MINUTE_MS,
            Self::OneHour => HOUR_MS,
            Self::TwoHours => 2 * HOUR_MS,
            Self::FourHours => 4 * HOUR_MS,
            Self::SixHours => 6 * HOUR_MS,
            Self::EightHours => 8 * HOUR_MS,
            Self::TwelveHours => 12 * HOUR_MS,
            Self::OneDay => DAY_MS,
            Self::ThreeDays => 3 * DAY_MS,
            Self::OneWeek => 7 * DAY_MS,
            Self::OneMonth => 30 * DAY_MS,
        }
    }

    /// The bar duration as a [`chrono::Duration`].
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.duration_ms())
    }

    /// The bar duration in whole minutes, used by freshness-bucket calculations.
    pub const fn as_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }
}

/// Freshness bucket of a job's newest stored candle relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `minutes_since_newest <= 2 * timeframe_minutes`
    Fresh,
    /// `minutes_since_newest <= 10 * timeframe_minutes`
    Stale,
    VeryStale,
}

impl Freshness {
    pub fn classify(minutes_since_newest: i64, timeframe: Timeframe) -> Self {
        let unit = timeframe.as_minutes();
        if minutes_since_newest <= 2 * unit {
            Self::Fresh
        } else if minutes_since_newest <= 10 * unit {
            Self::Stale
        } else {
            Self::VeryStale
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
            Self::VeryStale => write!(f, "very_stale"),
        }
    }
}

/// Overall data-quality classification for a (exchange, symbol, timeframe) series.
///
/// See [`crate::db::postgres::store::quality`] for the derivation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
        }
    }
}
