//! Filtered export of one `(source, destination)` pair.
//!
//! An empty result is a value, not an error: rendering it produces the usual
//! header followed by a `#` marker line, so downstream consumers see the same
//! columns either way and can tell "no traffic" from "no file".

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use flowstat_core::accumulator::Accumulator;
use flowstat_core::key::GroupKey;
use flowstat_core::state::ConsolidatedState;
use regex::Regex;

use crate::delimited;
use crate::snapshot::{write_report_row, REPORT_HEADER};

/// Exact-match filter on the key's pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFilter {
    pub source: String,
    pub destination: String,
}

impl PairFilter {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// Details of an export that matched nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyExport {
    pub source: String,
    pub destination: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportResult {
    /// Matching entries in key order.
    Matches(Vec<(GroupKey, Accumulator)>),
    Empty(EmptyExport),
}

impl ExportResult {
    pub fn len(&self) -> usize {
        match self {
            ExportResult::Matches(rows) => rows.len(),
            ExportResult::Empty(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn export(state: &ConsolidatedState, filter: &PairFilter) -> ExportResult {
    export_at(state, filter, Utc::now())
}

/// [`export`] with an explicit timestamp for the empty marker.
pub fn export_at(
    state: &ConsolidatedState,
    filter: &PairFilter,
    now: DateTime<Utc>,
) -> ExportResult {
    let rows: Vec<(GroupKey, Accumulator)> = state
        .iter()
        .filter(|(key, _)| key.matches_pair(&filter.source, &filter.destination))
        .map(|(key, acc)| (key.clone(), *acc))
        .collect();

    if rows.is_empty() {
        ExportResult::Empty(EmptyExport {
            source: filter.source.clone(),
            destination: filter.destination.clone(),
            generated_at: now,
        })
    } else {
        ExportResult::Matches(rows)
    }
}

/// Render an export as delimited text. The header is always written; an
/// empty export follows it with a single marker line.
pub fn render_csv(result: &ExportResult) -> String {
    let mut out = String::new();
    delimited::write_record(&mut out, &REPORT_HEADER, ',');
    match result {
        ExportResult::Matches(rows) => {
            for (key, acc) in rows {
                write_report_row(&mut out, key, acc);
            }
        }
        ExportResult::Empty(empty) => out.push_str(&format!(
            "# No matching rows for src={} dst={} at {}\n",
            empty.source,
            empty.destination,
            empty.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )),
    }
    out
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9A-Za-z.:\-]").expect("regex is valid"))
}

/// File name for a pair's export: `<src>__<dst>.csv` with every character
/// outside `[0-9A-Za-z.:-]` replaced by `_`.
pub fn export_file_name(source: &str, destination: &str) -> String {
    format!(
        "{}__{}.csv",
        unsafe_chars().replace_all(source, "_"),
        unsafe_chars().replace_all(destination, "_")
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use flowstat_core::state::{merge, PartialBatch};

    fn key(src: &str, dst: &str, day: u32) -> GroupKey {
        GroupKey::new(src, dst, NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
    }

    fn state() -> ConsolidatedState {
        let mut b = PartialBatch::new("day1_summary.csv");
        b.add(key("A", "B", 2), 4.0);
        b.add(key("A", "B", 1), 1.5);
        b.add(key("A", "C", 1), 9.0);
        b.add(key("B", "A", 1), 2.0);
        merge(ConsolidatedState::new(), [&b]).0
    }

    fn noon() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-03T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_export_matches_exact_pair_in_order() {
        let result = export(&state(), &PairFilter::new("A", "B"));
        let ExportResult::Matches(rows) = &result else {
            panic!("expected matches, got {result:?}");
        };
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![key("A", "B", 1), key("A", "B", 2)]);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_export_unknown_pair_yields_marker() {
        let result = export_at(&state(), &PairFilter::new("X", "Y"), noon());
        assert!(result.is_empty());
        assert_eq!(
            result,
            ExportResult::Empty(EmptyExport {
                source: "X".to_string(),
                destination: "Y".to_string(),
                generated_at: noon(),
            })
        );
        assert_eq!(
            render_csv(&result),
            "Src,Dst,Date,Count,Sum,Average,StdDev\n\
             # No matching rows for src=X dst=Y at 2024-01-03T12:00:00Z\n"
        );
    }

    #[test]
    fn test_export_from_empty_state_is_not_an_error() {
        let result = export(&ConsolidatedState::new(), &PairFilter::new("X", "Y"));
        assert!(matches!(result, ExportResult::Empty(_)));
    }

    #[test]
    fn test_render_matches() {
        let result = export(&state(), &PairFilter::new("A", "B"));
        assert_eq!(
            render_csv(&result),
            "Src,Dst,Date,Count,Sum,Average,StdDev\n\
             A,B,2024-01-01,1,1.5,1.5,0\n\
             A,B,2024-01-02,1,4,4,0\n"
        );
    }

    #[test]
    fn test_export_file_name_sanitises() {
        assert_eq!(export_file_name("10.0.0.1", "10.0.0.2"), "10.0.0.1__10.0.0.2.csv");
        assert_eq!(export_file_name("fe80::1", "a/b c"), "fe80::1__a_b_c.csv");
        assert_eq!(export_file_name("../etc", "x"), ".._etc__x.csv");
    }
}
