use chrono::NaiveDate;
use std::fmt;

/// Identity of one aggregation group: traffic from `source` to `destination`
/// on a calendar `date`.
///
/// The derived ordering compares source, then destination, then date, all
/// ascending. Every sorted output (summary files, snapshots, exports) relies
/// on it, so the field order must not change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    source: String,
    destination: String,
    date: NaiveDate,
}

impl GroupKey {
    pub fn new(source: impl Into<String>, destination: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            date,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// `true` when the key belongs to the exact `(source, destination)` pair.
    pub fn matches_pair(&self, source: &str, destination: &str) -> bool {
        self.source == source && self.destination == destination
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}→{}@{}",
            self.source,
            self.destination,
            self.date.format("%Y-%m-%d")
        )
    }
}
