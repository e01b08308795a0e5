//! GPS time and acquisition-date handling.
//!
//! Sample times are reported on the GPS time scale (milliseconds
//! since 1980-01-06T00:00:00Z). Conversions ignore leap seconds:
//! the filters in this crate only compare deltas between timestamps
//! converted the same way, so the offset cancels.

use anyhow::{bail, ensure, Context, Error, Result};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use serde_derive::Deserialize;
use std::str::FromStr;

/// The GPS epoch on the unix time scale, in milliseconds.
const GPS_EPOCH_UNIX_MS: i64 = 315_964_800_000;

/// Milliseconds since the GPS epoch. The zero value means "not set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct GpsTime(i64);

impl GpsTime {
    pub const ZERO: GpsTime = GpsTime(0);

    pub fn from_millis(ms: i64) -> Self {
        GpsTime(ms)
    }

    pub fn from_utc(t: &DateTime<Utc>) -> Self {
        GpsTime(t.timestamp_millis() - GPS_EPOCH_UNIX_MS)
    }

    #[inline]
    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Seconds since the GPS epoch, as reported in samples.
    #[inline]
    pub fn seconds(&self) -> f64 {
        self.0 as f64 / 1000.
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0 > 0
    }
}

/// Parse a timestamp as it appears in index files: RFC 3339 with an
/// optional fractional part, or a plain `YYYY-MM-DD HH:MM:SS`.
pub fn parse_iso(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .with_context(|| format!("unparseable timestamp: {:?}", s))
}

/// An ISO-8601 timestamp as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct IsoTime(pub DateTime<Utc>);

impl TryFrom<String> for IsoTime {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        parse_iso(&s).map(IsoTime)
    }
}

/// A closed time interval; either end may be open.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn is_bounded(&self) -> bool {
        self.start.is_some() || self.stop.is_some()
    }

    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| *t >= s) && self.stop.map_or(true, |e| *t <= e)
    }
}

/// A day-of-year acceptance test, parsed from `start:end` with an
/// optional `!` prefix to invert the test. Both ends are day-of-year
/// numbers, inclusive; dates *inside* the range pass unless the range
/// is inverted.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct DayRange {
    start: u32,
    end: u32,
    keep_inrange: bool,
}

impl DayRange {
    pub fn keeps(&self, date: &DateTime<Utc>) -> bool {
        let doy = date.ordinal();
        let inrange = doy >= self.start && doy <= self.end;
        inrange == self.keep_inrange
    }

    /// Test an optional date; a missing date counts as outside the
    /// range.
    pub fn keeps_opt(&self, date: Option<&DateTime<Utc>>) -> bool {
        match date {
            Some(d) => self.keeps(d),
            None => !self.keep_inrange,
        }
    }
}

impl FromStr for DayRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (keep_inrange, body) = match s.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, s),
        };
        ensure!(
            body.chars().all(|c| c.is_ascii_digit() || c == ':'),
            "invalid day-of-year range: {:?}",
            s
        );
        let mut parts = body.split(':');
        let (start, end) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => (a, b),
            _ => bail!("expected day-of-year range as start:end, got {:?}", s),
        };
        let start: u32 = start.parse()?;
        let end: u32 = end.parse()?;
        ensure!(
            (1..=366).contains(&start) && (1..=366).contains(&end) && start < end,
            "day-of-year range out of bounds: {:?}",
            s
        );
        Ok(DayRange {
            start,
            end,
            keep_inrange,
        })
    }
}

impl TryFrom<String> for DayRange {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}
