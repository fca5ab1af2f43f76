use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

// ── System timezone detection ─────────────────────────────────────────────────

/// Detect the IANA timezone name of the running system.
///
/// Uses the `iana-time-zone` crate directly – no subprocess calls.
/// Falls back to `"UTC"` if detection fails.
pub fn get_system_timezone() -> String {
    iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string())
}

/// Validate that `tz_name` is a recognised IANA timezone identifier.
pub fn validate_timezone(tz_name: &str) -> bool {
    tz_name.parse::<Tz>().is_ok()
}

/// Format a calendar date the way every file format in flowstat expects it.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Timestamp used in immutable snapshot names, millisecond precision.
pub fn archive_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%3f").to_string()
}

// ── DateResolver ──────────────────────────────────────────────────────────────

/// Naive date-time layouts seen in flow exports, interpreted as local time.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d/%m/%Y %I:%M:%S %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

/// Turns a date or timestamp field into the calendar date it belongs to.
///
/// Timestamps carrying an explicit offset are converted into the resolver's
/// zone before the date is taken; naive values are already local.
#[derive(Debug, Clone, Copy)]
pub struct DateResolver {
    zone: Tz,
}

impl Default for DateResolver {
    fn default() -> Self {
        Self { zone: Tz::UTC }
    }
}

impl DateResolver {
    /// Create a resolver for the given IANA timezone name.
    ///
    /// If `tz_name` is not a recognised IANA timezone, falls back to UTC
    /// and logs a warning.
    pub fn new(tz_name: &str) -> Self {
        let zone = tz_name.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                "DateResolver: unrecognised timezone \"{}\", falling back to UTC",
                tz_name
            );
            Tz::UTC
        });
        Self { zone }
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    /// Resolve `s` to a calendar date, or `None` for unrecognised input.
    pub fn resolve(&self, s: &str) -> Option<NaiveDate> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        for fmt in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                return Some(date);
            }
        }

        for fmt in NAIVE_DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return Some(naive.date());
            }
        }

        // Replace trailing 'Z' with '+00:00' for RFC 3339 compatibility.
        let normalised = match s.strip_suffix('Z') {
            Some(stripped) => format!("{}+00:00", stripped),
            None => s.to_string(),
        };
        if let Ok(dt) = DateTime::parse_from_rfc3339(&normalised) {
            return Some(dt.with_timezone(&self.zone).date_naive());
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
            return Some(dt.with_timezone(&self.zone).date_naive());
        }

        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
