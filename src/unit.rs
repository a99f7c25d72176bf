//! Time units and the conversion tables used by the window script.
//!
//! Units are totally ordered from the finest (millisecond) to the coarsest
//! (year). Months are 30 days and years 365 days; nothing here is calendar
//! aware.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MS_PER_SECOND: u64 = 1000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i8)]
pub enum Unit {
    Millisecond = -3,
    Centisecond = -2,
    Decisecond = -1,
    Second = 0,
    Minute = 1,
    Hour = 2,
    Day = 3,
    Week = 4,
    Month = 5,
    Year = 6,
}

impl Unit {
    /// Every unit, finest first.
    pub const ALL: [Unit; 10] = [
        Unit::Millisecond,
        Unit::Centisecond,
        Unit::Decisecond,
        Unit::Second,
        Unit::Minute,
        Unit::Hour,
        Unit::Day,
        Unit::Week,
        Unit::Month,
        Unit::Year,
    ];

    pub const fn as_i8(self) -> i8 {
        self as i8
    }

    /// Exact duration of one unit in milliseconds.
    pub const fn millis(self) -> u64 {
        match self {
            Unit::Millisecond => 1,
            Unit::Centisecond => 10,
            Unit::Decisecond => 100,
            Unit::Second => MS_PER_SECOND,
            Unit::Minute => MS_PER_MINUTE,
            Unit::Hour => MS_PER_HOUR,
            Unit::Day => MS_PER_DAY,
            Unit::Week => 7 * MS_PER_DAY,
            Unit::Month => 30 * MS_PER_DAY,
            Unit::Year => 365 * MS_PER_DAY,
        }
    }

    /// Number of `subdivision` ticks contained in one `window` unit.
    ///
    /// Returns `None` when the subdivision is coarser than the window. Counts
    /// are whole ticks, so a month holds 4 weeks and a year 12 months.
    pub const fn subdivisions(window: Unit, subdivision: Unit) -> Option<u64> {
        if (subdivision as i8) > (window as i8) {
            return None;
        }
        Some(window.millis() / subdivision.millis())
    }

    /// Factor turning a microsecond timestamp into a score at this unit's
    /// resolution. The product must be floored to get the score.
    pub fn microsecond_factor(self) -> f64 {
        1.0 / (self.millis() * 1000) as f64
    }

    pub const fn name(self) -> &'static str {
        match self {
            Unit::Millisecond => "millisecond",
            Unit::Centisecond => "centisecond",
            Unit::Decisecond => "decisecond",
            Unit::Second => "second",
            Unit::Minute => "minute",
            Unit::Hour => "hour",
            Unit::Day => "day",
            Unit::Week => "week",
            Unit::Month => "month",
            Unit::Year => "year",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Unit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s.trim().to_lowercase().as_str() {
            "ms" | "millisecond" | "milliseconds" => Unit::Millisecond,
            "cs" | "centisecond" | "centiseconds" => Unit::Centisecond,
            "ds" | "decisecond" | "deciseconds" => Unit::Decisecond,
            "s" | "sec" | "second" | "seconds" => Unit::Second,
            "m" | "min" | "minute" | "minutes" => Unit::Minute,
            "h" | "hour" | "hours" => Unit::Hour,
            "d" | "day" | "days" => Unit::Day,
            "w" | "week" | "weeks" => Unit::Week,
            "mo" | "month" | "months" => Unit::Month,
            "y" | "year" | "years" => Unit::Year,
            _ => return Err(ConfigError::UnknownUnit(s.to_string())),
        };
        Ok(unit)
    }
}
