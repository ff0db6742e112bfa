//! Calendar periods and their time windows.
//!
//! - Period types: day, month, year and the all-time overview.
//! - A period is identified by `(period_type, start_day)`; `start_day` is the first calendar
//!   day of the period (the all-time period uses [`ALL_TIME_START`]).
//! - Windows are half-open `[start, next_start)` and evaluated at local midnight in the
//!   grouping time zone, so the periods of one type are disjoint and contiguous.
//! - Months also have a linear id (`year * 12 + month0`), the key of the refresh planner's
//!   month bitmap.

use std::{fmt, str::FromStr};

use anyhow::bail;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::{error::SummaryError, tz};

/// `start_day` of the all-time overview row.
pub const ALL_TIME_START: NaiveDate = match NaiveDate::from_ymd_opt(1900, 1, 1) {
    Some(d) => d,
    None => unreachable!(),
};

/// Granularity of an overview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeriodType {
    /// One calendar day.
    Day,
    /// One calendar month.
    Month,
    /// One calendar year.
    Year,
    /// Every dataset of the product.
    All,
}

impl PeriodType {
    /// Storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            PeriodType::Day => "day",
            PeriodType::Month => "month",
            PeriodType::Year => "year",
            PeriodType::All => "all",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "day" => PeriodType::Day,
            "month" => PeriodType::Month,
            "year" => PeriodType::Year,
            "all" => PeriodType::All,
            other => bail!("unknown period type: {other}"),
        })
    }
}

/// A UTC time range; `None` bounds are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Inclusive start.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive end.
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Window with no bounds.
    pub const UNBOUNDED: TimeWindow = TimeWindow {
        start: None,
        end: None,
    };

    /// Whether `ts` lies in `[start, end)`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| ts >= s) && self.end.is_none_or(|e| ts < e)
    }

    /// Bounds in storage format, for comparison against stored timestamps.
    pub fn bounds_rfc3339(&self) -> (Option<String>, Option<String>) {
        (
            self.start.map(tz::to_rfc3339_millis),
            self.end.map(tz::to_rfc3339_millis),
        )
    }
}

/// One overview period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    /// Granularity.
    pub period_type: PeriodType,
    /// First day of the period.
    pub start_day: NaiveDate,
}

impl Period {
    /// The all-time period.
    pub const fn all() -> Self {
        Period {
            period_type: PeriodType::All,
            start_day: ALL_TIME_START,
        }
    }

    /// The day period for `day`.
    pub const fn day(day: NaiveDate) -> Self {
        Period {
            period_type: PeriodType::Day,
            start_day: day,
        }
    }

    /// The month period `year`-`month`.
    pub fn month(year: i32, month: u32) -> anyhow::Result<Self> {
        Self::from_time_spec(Some(year), Some(month), None)
    }

    /// The year period `year`.
    pub fn year(year: i32) -> anyhow::Result<Self> {
        Self::from_time_spec(Some(year), None, None)
    }

    /// Select a period from a partially-specified date.
    ///
    /// `(None, None, None)` is the all-time period, `(y, None, None)` a year,
    /// `(y, m, None)` a month and `(y, m, d)` a day. Any other combination, or an
    /// out-of-range component, is [`SummaryError::InvalidTimeSpec`].
    pub fn from_time_spec(
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
    ) -> anyhow::Result<Self> {
        let invalid = || SummaryError::InvalidTimeSpec { year, month, day };
        let (period_type, ymd) = match (year, month, day) {
            (None, None, None) => return Ok(Self::all()),
            (Some(y), None, None) => (PeriodType::Year, (y, 1, 1)),
            (Some(y), Some(m), None) => (PeriodType::Month, (y, m, 1)),
            (Some(y), Some(m), Some(d)) => (PeriodType::Day, (y, m, d)),
            _ => return Err(invalid().into()),
        };
        let start_day = NaiveDate::from_ymd_opt(ymd.0, ymd.1, ymd.2).ok_or_else(invalid)?;
        Ok(Period {
            period_type,
            start_day,
        })
    }

    /// The period of type `period_type` that contains calendar day `date`.
    pub fn containing(period_type: PeriodType, date: NaiveDate) -> Self {
        let start_day = match period_type {
            PeriodType::Day => date,
            PeriodType::Month => date.with_day(1).unwrap_or(date),
            PeriodType::Year => date.with_ordinal(1).unwrap_or(date),
            PeriodType::All => ALL_TIME_START,
        };
        Period {
            period_type,
            start_day,
        }
    }

    /// First day of the following period; `None` for the all-time period.
    pub fn next_start(&self) -> Option<NaiveDate> {
        match self.period_type {
            PeriodType::Day => self.start_day.succ_opt(),
            PeriodType::Month => self.start_day.checked_add_months(Months::new(1)),
            PeriodType::Year => self.start_day.checked_add_months(Months::new(12)),
            PeriodType::All => None,
        }
    }

    /// UTC window `[start, next_start)` with both ends at local midnight in `tz`.
    pub fn window(&self, tz: Tz) -> anyhow::Result<TimeWindow> {
        if self.period_type == PeriodType::All {
            return Ok(TimeWindow::UNBOUNDED);
        }
        let start = tz::local_midnight_utc(self.start_day, tz)?;
        let end = self
            .next_start()
            .map(|d| tz::local_midnight_utc(d, tz))
            .transpose()?;
        Ok(TimeWindow {
            start: Some(start),
            end,
        })
    }

    /// The next-finer periods that partition this one: months of a year, days of a month.
    pub fn children(&self) -> Vec<Period> {
        let child_type = match self.period_type {
            PeriodType::Year => PeriodType::Month,
            PeriodType::Month => PeriodType::Day,
            PeriodType::Day | PeriodType::All => return Vec::new(),
        };
        let Some(end) = self.next_start() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cur = Period {
            period_type: child_type,
            start_day: self.start_day,
        };
        while cur.start_day < end {
            out.push(cur);
            match cur.next_start() {
                Some(next) => cur.start_day = next,
                None => break,
            }
        }
        out
    }

    /// `start_day` in storage format (YYYY-MM-DD).
    pub fn start_day_str(&self) -> String {
        self.start_day.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.period_type, self.start_day)
    }
}

/// Parse a stored `start_day`.
pub fn parse_start_day(s: &str) -> anyhow::Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(s, "%Y-%m-%d")?)
}

/// Linear month id: `year * 12 + (month - 1)`.
pub fn month_id(date: NaiveDate) -> Option<u32> {
    let idx = i64::from(date.year()) * 12 + i64::from(date.month0());
    u32::try_from(idx).ok()
}

/// First day of the month with linear id `id`.
pub fn month_from_id(id: u32) -> Option<NaiveDate> {
    let y = i32::try_from(id / 12).ok()?;
    NaiveDate::from_ymd_opt(y, id % 12 + 1, 1)
}
