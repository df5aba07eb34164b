//! Dataset versions (model run / publication timestamps) and the step
//! arithmetic used to walk between candidate versions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("Cannot parse '{0}' as an ISO-8601 version")]
    Parse(String),

    #[error("Invalid step '{0}': expected <n>h, <n>d or <n>mo with n > 0")]
    InvalidStep(String),

    #[error("Version arithmetic overflowed stepping {step} from {from}")]
    OutOfRange { from: Version, step: Step },
}

/// Granularity at which a dataset publishes new versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Hours(u32),
    Days(u32),
    Months(u32),
}

impl FromStr for Step {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (digits, ctor): (&str, fn(u32) -> Step) = if let Some(n) = trimmed.strip_suffix("mo") {
            (n, Step::Months)
        } else if let Some(n) = trimmed.strip_suffix('h') {
            (n, Step::Hours)
        } else if let Some(n) = trimmed.strip_suffix('d') {
            (n, Step::Days)
        } else {
            return Err(VersionError::InvalidStep(s.to_string()));
        };
        match digits.parse::<u32>() {
            Ok(n) if n > 0 => Ok(ctor(n)),
            _ => Err(VersionError::InvalidStep(s.to_string())),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Hours(n) => write!(f, "{}h", n),
            Step::Days(n) => write!(f, "{}d", n),
            Step::Months(n) => write!(f, "{}mo", n),
        }
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One published snapshot of a dataset, at second granularity in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(DateTime<Utc>);

impl Version {
    pub fn new(at: DateTime<Utc>) -> Self {
        // Sub-second precision never appears in archive layouts; dropping it
        // keeps the ISO form round-trippable.
        let at = at.with_nanosecond(0).unwrap_or(at);
        Self(at)
    }

    pub fn from_ymd_h(year: i32, month: u32, day: u32, hour: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .map(Self)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Render as a naive ISO-8601 timestamp (`2024-03-01T12:00:00`), the
    /// layout used by existing state files.
    pub fn to_iso8601(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    /// Parse an ISO-8601 timestamp. Offset-carrying forms are normalized to
    /// UTC; naive forms and bare dates are taken as UTC.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::new(dt.with_timezone(&Utc)));
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(Self::new(naive.and_utc()));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self(naive.and_utc()));
            }
        }
        Err(VersionError::Parse(s.to_string()))
    }

    /// The most recent publication slot at or before `now`.
    ///
    /// Hourly steps are anchored at 00 UTC (`6h` gives 00/06/12/18), daily
    /// steps at midnight and monthly steps at the first of the month.
    pub fn latest_slot(now: DateTime<Utc>, step: Step) -> Self {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|n| n.and_utc())
            .unwrap_or(now);
        let slot = match step {
            Step::Hours(n) if n > 0 && n < 24 => {
                let hour = now.hour() - now.hour() % n;
                midnight + chrono::Duration::hours(i64::from(hour))
            }
            Step::Hours(_) | Step::Days(_) => midnight,
            Step::Months(_) => now
                .date_naive()
                .with_day(1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|n| n.and_utc())
                .unwrap_or(midnight),
        };
        Self(slot)
    }

    pub fn checked_sub(&self, step: Step) -> Result<Self, VersionError> {
        let out = match step {
            Step::Hours(n) => self.0.checked_sub_signed(chrono::Duration::hours(i64::from(n))),
            Step::Days(n) => self.0.checked_sub_signed(chrono::Duration::days(i64::from(n))),
            Step::Months(n) => self.0.checked_sub_months(Months::new(n)),
        };
        out.map(Self).ok_or(VersionError::OutOfRange { from: *self, step })
    }

    pub fn checked_add(&self, step: Step) -> Result<Self, VersionError> {
        let out = match step {
            Step::Hours(n) => self.0.checked_add_signed(chrono::Duration::hours(i64::from(n))),
            Step::Days(n) => self.0.checked_add_signed(chrono::Duration::days(i64::from(n))),
            Step::Months(n) => self.0.checked_add_months(Months::new(n)),
        };
        out.map(Self).ok_or(VersionError::OutOfRange { from: *self, step })
    }

    /// Date fields substituted into archive URL templates.
    pub fn template_parts(&self) -> [(&'static str, String); 7] {
        let d = self.0;
        [
            ("_yyyymmdd", d.format("%Y%m%d").to_string()),
            ("_H", d.format("%H").to_string()),
            ("_yyyymmddHHMMSS", d.format("%Y%m%d%H%M%S").to_string()),
            ("_yyyy", format!("{:04}", d.year())),
            ("_mm", format!("{:02}", d.month())),
            ("_dd", format!("{:02}", d.day())),
            ("_HHMM", d.format("%H%M").to_string()),
        ]
    }

    /// Timestamp form embedded in persisted artifact file names.
    pub fn file_stamp(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%S.000Z").to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso8601())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(y: i32, m: u32, d: u32, h: u32) -> Version {
        Version::from_ymd_h(y, m, d, h).unwrap()
    }

    #[test]
    fn test_iso_round_trip() {
        let original = Version::new(Utc.with_ymd_and_hms(2024, 2, 29, 18, 45, 7).unwrap());
        let parsed = Version::parse(&original.to_iso8601()).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(original.to_iso8601(), "2024-02-29T18:45:07");
    }

    #[test]
    fn test_parse_accepts_offsets_and_dates() {
        assert_eq!(Version::parse("2024-01-01T06:00:00Z").unwrap(), v(2024, 1, 1, 6));
        assert_eq!(
            Version::parse("2024-01-01T08:00:00+02:00").unwrap(),
            v(2024, 1, 1, 6)
        );
        assert_eq!(Version::parse("2024-01-01").unwrap(), v(2024, 1, 1, 0));
        assert_eq!(
            Version::parse("2024-01-01T06:00:00.250").unwrap(),
            v(2024, 1, 1, 6)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(Version::parse(""), Err(VersionError::Parse(_))));
        assert!(matches!(Version::parse("yesterday"), Err(VersionError::Parse(_))));
    }

    #[test]
    fn test_step_parse() {
        assert_eq!("6h".parse::<Step>().unwrap(), Step::Hours(6));
        assert_eq!("1d".parse::<Step>().unwrap(), Step::Days(1));
        assert_eq!("3mo".parse::<Step>().unwrap(), Step::Months(3));
        assert!("0h".parse::<Step>().is_err());
        assert!("6".parse::<Step>().is_err());
        assert!("xh".parse::<Step>().is_err());
    }

    #[test]
    fn test_latest_slot_six_hourly() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 13, 59, 12).unwrap();
        assert_eq!(Version::latest_slot(now, Step::Hours(6)), v(2024, 5, 10, 12));
        let early = Utc.with_ymd_and_hms(2024, 5, 10, 5, 0, 0).unwrap();
        assert_eq!(Version::latest_slot(early, Step::Hours(6)), v(2024, 5, 10, 0));
    }

    #[test]
    fn test_latest_slot_daily_and_monthly() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 13, 0, 0).unwrap();
        assert_eq!(Version::latest_slot(now, Step::Days(1)), v(2024, 5, 10, 0));
        assert_eq!(Version::latest_slot(now, Step::Hours(24)), v(2024, 5, 10, 0));
        assert_eq!(Version::latest_slot(now, Step::Months(1)), v(2024, 5, 1, 0));
    }

    #[test]
    fn test_step_arithmetic_crosses_boundaries() {
        assert_eq!(v(2024, 1, 1, 0).checked_sub(Step::Hours(6)).unwrap(), v(2023, 12, 31, 18));
        assert_eq!(v(2023, 12, 1, 0).checked_add(Step::Months(1)).unwrap(), v(2024, 1, 1, 0));
        assert_eq!(v(2024, 3, 1, 0).checked_sub(Step::Days(1)).unwrap(), v(2024, 2, 29, 0));
    }

    #[test]
    fn test_template_parts() {
        let parts = v(2024, 3, 7, 6).template_parts();
        let get = |k: &str| parts.iter().find(|(n, _)| *n == k).unwrap().1.clone();
        assert_eq!(get("_yyyymmdd"), "20240307");
        assert_eq!(get("_H"), "06");
        assert_eq!(get("_yyyymmddHHMMSS"), "20240307060000");
        assert_eq!(get("_mm"), "03");
    }

    #[test]
    fn test_serde_uses_iso_string() {
        let json = serde_json::to_string(&v(2024, 3, 7, 6)).unwrap();
        assert_eq!(json, "\"2024-03-07T06:00:00\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v(2024, 3, 7, 6));
    }
}
