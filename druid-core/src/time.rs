//! ISO-8601 interval handling for Druid queries

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{DruidError, DruidResult};

/// Time interval a query covers, `start` inclusive and `end` exclusive.
///
/// Druid expresses intervals as `start/end` strings. Either side may be a
/// full timestamp or a partial date (`"1000/3000"` covers the years 1000 to
/// 3000), and one side may be an ISO-8601 period such as `P1D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Interval {
    /// Create a new interval
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> DruidResult<Self> {
        if end < start {
            return Err(DruidError::TimeRange(format!(
                "Interval end {} is before start {}",
                format_instant(&end),
                format_instant(&start)
            )));
        }

        Ok(Self { start, end })
    }

    /// Create an interval from milliseconds since the Unix epoch
    pub fn from_millis(start_ms: i64, end_ms: i64) -> DruidResult<Self> {
        let start = instant_from_millis(start_ms)?;
        let end = instant_from_millis(end_ms)?;
        Self::new(start, end)
    }

    /// Parse a `start/end` interval string
    pub fn parse(s: &str) -> DruidResult<Self> {
        let (left, right) = s.trim().split_once('/').ok_or_else(|| {
            DruidError::TimeRange(format!("Interval '{}' is not of the form start/end", s))
        })?;

        match (left.starts_with('P'), right.starts_with('P')) {
            (true, true) => Err(DruidError::TimeRange(format!(
                "Interval '{}' cannot have a period on both sides",
                s
            ))),
            (false, true) => {
                let start = parse_instant(left)?;
                let end = Period::parse(right)?.after(start)?;
                Self::new(start, end)
            }
            (true, false) => {
                let end = parse_instant(right)?;
                let start = Period::parse(left)?.before(end)?;
                Self::new(start, end)
            }
            (false, false) => Self::new(parse_instant(left)?, parse_instant(right)?),
        }
    }

    /// Inclusive start
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Get the duration of this interval in milliseconds
    pub fn duration_millis(&self) -> i64 {
        self.end.timestamp_millis() - self.start.timestamp_millis()
    }

    /// Check if an instant falls within this interval
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    /// Check if this interval overlaps with another
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            format_instant(&self.start),
            format_instant(&self.end)
        )
    }
}

impl FromStr for Interval {
    type Err = DruidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Interval::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn instant_from_millis(millis: i64) -> DruidResult<DateTime<Utc>> {
    match Utc.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(dt) => Ok(dt),
        _ => Err(DruidError::TimeRange(format!("Invalid timestamp: {}", millis))),
    }
}

/// Parse one side of an interval. Full RFC 3339 timestamps are tried first,
/// then Joda-style partial forms in UTC.
fn parse_instant(raw: &str) -> DruidResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    let invalid = || DruidError::TimeRange(format!("Invalid interval endpoint: '{}'", raw));

    let (date_part, time_part) = match raw.split_once('T') {
        Some((date, time)) => (date, Some(time.strip_suffix('Z').unwrap_or(time))),
        None => (raw, None),
    };

    let mut date_fields = date_part.split('-');
    let year: i32 = date_fields
        .next()
        .filter(|y| !y.is_empty())
        .and_then(|y| y.parse().ok())
        .ok_or_else(invalid)?;
    let month: u32 = parse_field(date_fields.next(), 1).ok_or_else(invalid)?;
    let day: u32 = parse_field(date_fields.next(), 1).ok_or_else(invalid)?;
    if date_fields.next().is_some() {
        return Err(invalid());
    }
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;

    let time = match time_part {
        None => NaiveTime::MIN,
        Some(time) => {
            let (hms, fraction) = match time.split_once('.') {
                Some((hms, fraction)) => (hms, Some(fraction)),
                None => (time, None),
            };
            let mut fields = hms.split(':');
            let hour: u32 = fields
                .next()
                .and_then(|h| h.parse().ok())
                .ok_or_else(invalid)?;
            let minute: u32 = parse_field(fields.next(), 0).ok_or_else(invalid)?;
            let second: u32 = parse_field(fields.next(), 0).ok_or_else(invalid)?;
            if fields.next().is_some() {
                return Err(invalid());
            }
            let millis = match fraction {
                None => 0,
                Some(f) if !f.is_empty() && f.len() <= 3 && f.bytes().all(|b| b.is_ascii_digit()) => {
                    format!("{:0<3}", f).parse().map_err(|_| invalid())?
                }
                Some(_) => return Err(invalid()),
            };
            NaiveTime::from_hms_milli_opt(hour, minute, second, millis).ok_or_else(invalid)?
        }
    };

    Ok(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
}

fn parse_field(field: Option<&str>, default: u32) -> Option<u32> {
    match field {
        None => Some(default),
        Some(value) => value.parse().ok(),
    }
}

/// ISO-8601 period such as `P1D`, `PT6H` or `P1Y2M`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Period {
    months: u32,
    millis: i64,
}

impl Period {
    fn parse(raw: &str) -> DruidResult<Self> {
        let invalid = || DruidError::TimeRange(format!("Invalid period: '{}'", raw));
        let body = raw.strip_prefix('P').ok_or_else(invalid)?;
        if body.is_empty() {
            return Err(invalid());
        }

        let mut period = Period::default();
        let mut in_time = false;
        let mut time_units = 0;
        let mut number = String::new();

        for c in body.chars() {
            if c == 'T' {
                if in_time || !number.is_empty() {
                    return Err(invalid());
                }
                in_time = true;
                continue;
            }
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }

            let amount: i64 = number.parse().map_err(|_| invalid())?;
            number.clear();
            if in_time {
                time_units += 1;
            }
            let (months, millis_per_unit) = match (in_time, c) {
                (false, 'Y') => (amount.checked_mul(12), 0),
                (false, 'M') => (Some(amount), 0),
                (false, 'W') => (Some(0), 7 * 86_400_000),
                (false, 'D') => (Some(0), 86_400_000),
                (true, 'H') => (Some(0), 3_600_000),
                (true, 'M') => (Some(0), 60_000),
                (true, 'S') => (Some(0), 1_000),
                _ => return Err(invalid()),
            };
            let months = months
                .and_then(|m| u32::try_from(m).ok())
                .and_then(|m| period.months.checked_add(m))
                .ok_or_else(invalid)?;
            let millis = amount
                .checked_mul(millis_per_unit)
                .and_then(|m| period.millis.checked_add(m))
                .ok_or_else(invalid)?;
            period = Period { months, millis };
        }

        // A 'T' must be followed by at least one time unit
        if !number.is_empty() || (in_time && time_units == 0) {
            return Err(invalid());
        }
        Ok(period)
    }

    fn after(&self, start: DateTime<Utc>) -> DruidResult<DateTime<Utc>> {
        start
            .checked_add_months(Months::new(self.months))
            .and_then(|dt| dt.checked_add_signed(Duration::milliseconds(self.millis)))
            .ok_or_else(|| DruidError::TimeRange("Interval end overflow".to_string()))
    }

    fn before(&self, end: DateTime<Utc>) -> DruidResult<DateTime<Utc>> {
        end.checked_sub_months(Months::new(self.months))
            .and_then(|dt| dt.checked_sub_signed(Duration::milliseconds(self.millis)))
            .ok_or_else(|| DruidError::TimeRange("Interval start underflow".to_string()))
    }
}
