//! Serialized forms of a [`ConsolidatedState`].
//!
//! The JSON document is authoritative: it carries raw sums and the ledger of
//! applied batches. The delimited form is the human-facing report
//! (`Src,Dst,Date,Count,Sum,Average,StdDev`); reading it back rebuilds each
//! accumulator from `(count, sum, stddev)` and yields an empty ledger.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use flowstat_core::accumulator::Accumulator;
use flowstat_core::error::{FlowError, Result};
use flowstat_core::key::GroupKey;
use flowstat_core::state::{BatchId, ConsolidatedState};
use flowstat_core::time_utils::format_date;
use serde::{Deserialize, Serialize};

use crate::delimited;

pub const REPORT_HEADER: [&str; 7] = ["Src", "Dst", "Date", "Count", "Sum", "Average", "StdDev"];

// ── JSON document ─────────────────────────────────────────────────────────────

/// Top-level JSON snapshot document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub applied_batches: Vec<String>,
    #[serde(default)]
    pub aggregates: Vec<AggregateRow>,
}

/// One group's statistics. Older documents spell the fields `src`, `dst`
/// and `stdDev`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRow {
    #[serde(alias = "src")]
    pub source: String,
    #[serde(alias = "dst")]
    pub destination: String,
    pub date: NaiveDate,
    pub count: u64,
    pub sum: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum_squares: Option<f64>,
    #[serde(default)]
    pub average: f64,
    #[serde(default, alias = "stdDev")]
    pub stddev: f64,
}

/// Metadata stamped onto a persisted document.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    pub version: u64,
    pub tag: String,
    pub generated_at: DateTime<Utc>,
}

impl SnapshotDocument {
    pub fn from_state(state: &ConsolidatedState, meta: &SnapshotMeta) -> Self {
        let aggregates = state
            .iter()
            .map(|(key, acc)| AggregateRow {
                source: key.source().to_string(),
                destination: key.destination().to_string(),
                date: key.date(),
                count: acc.count(),
                sum: acc.sum(),
                sum_squares: Some(acc.sum_squares()),
                average: acc.mean(),
                stddev: acc.stddev(),
            })
            .collect();

        Self {
            version: meta.version,
            tag: Some(meta.tag.clone()),
            generated_at: Some(meta.generated_at),
            applied_batches: state
                .applied_batches()
                .map(|id| id.as_str().to_string())
                .collect(),
            aggregates,
        }
    }

    /// Rebuild the state, validating every accumulator.
    ///
    /// Rows without `sumSquares` are reconstructed from `stddev`. A key that
    /// appears twice is treated as corruption.
    pub fn into_state(self) -> Result<ConsolidatedState> {
        let mut entries = BTreeMap::new();
        for row in self.aggregates {
            let acc = match row.sum_squares {
                Some(sum_squares) => Accumulator::from_parts(row.count, row.sum, sum_squares),
                None => Accumulator::from_summary(row.count, row.sum, row.stddev),
            }
            .ok_or_else(|| {
                FlowError::MalformedSnapshot(format!(
                    "invalid statistics for {}→{}@{}",
                    row.source,
                    row.destination,
                    format_date(row.date)
                ))
            })?;
            insert_unique(&mut entries, GroupKey::new(row.source, row.destination, row.date), acc)?;
        }

        let applied: BTreeSet<BatchId> =
            self.applied_batches.into_iter().map(BatchId::from).collect();
        Ok(ConsolidatedState::from_parts(entries, applied))
    }
}

/// Serialize `state` as the authoritative JSON document.
///
/// Fails with `OutOfRange` when an entry has overflowed, since JSON has no
/// spelling for infinity and the document could not be read back.
pub fn encode_json(state: &ConsolidatedState, meta: &SnapshotMeta) -> Result<String> {
    state.ensure_finite()?;
    Ok(serde_json::to_string_pretty(&SnapshotDocument::from_state(
        state, meta,
    ))?)
}

/// Parse a JSON snapshot, returning the state and the version it records.
pub fn decode_json(bytes: &[u8]) -> Result<(ConsolidatedState, u64)> {
    let doc: SnapshotDocument = serde_json::from_slice(bytes)
        .map_err(|e| FlowError::MalformedSnapshot(format!("invalid JSON document: {}", e)))?;
    let version = doc.version;
    Ok((doc.into_state()?, version))
}

// ── Delimited report ──────────────────────────────────────────────────────────

/// Render the state as the sorted delimited report.
pub fn encode_csv(state: &ConsolidatedState) -> String {
    let mut out = String::new();
    delimited::write_record(&mut out, &REPORT_HEADER, ',');
    for (key, acc) in state.iter() {
        write_report_row(&mut out, key, acc);
    }
    out
}

pub(crate) fn write_report_row(out: &mut String, key: &GroupKey, acc: &Accumulator) {
    delimited::write_record(
        out,
        &[
            key.source().to_string(),
            key.destination().to_string(),
            format_date(key.date()),
            acc.count().to_string(),
            acc.sum().to_string(),
            acc.mean().to_string(),
            acc.stddev().to_string(),
        ],
        ',',
    );
}

/// Parse the delimited report back into a state with an empty ledger.
///
/// Unlike raw records, a bad row here means the snapshot is corrupt, so it
/// fails the whole read.
pub fn decode_csv(bytes: &[u8]) -> Result<ConsolidatedState> {
    let text = delimited::decode(bytes);
    let mut entries = BTreeMap::new();
    let mut first = true;

    for record in delimited::parse(&text, ',') {
        if record.is_blank() {
            continue;
        }
        let fields: Vec<&str> = record.fields.iter().map(|f| f.trim()).collect();
        if std::mem::take(&mut first) && fields[0].eq_ignore_ascii_case("src") {
            continue;
        }

        let malformed = |what: &str| {
            FlowError::MalformedSnapshot(format!("line {}: {}", record.line, what))
        };
        if fields.len() < 7 {
            return Err(malformed("expected 7 fields"));
        }

        let date = NaiveDate::parse_from_str(fields[2], "%Y-%m-%d")
            .map_err(|_| malformed("invalid date"))?;
        let count: u64 = fields[3].parse().map_err(|_| malformed("invalid count"))?;
        let sum: f64 = fields[4].parse().map_err(|_| malformed("invalid sum"))?;
        let stddev: f64 = fields[6].parse().map_err(|_| malformed("invalid stddev"))?;
        let acc = Accumulator::from_summary(count, sum, stddev)
            .ok_or_else(|| malformed("invalid statistics"))?;

        insert_unique(&mut entries, GroupKey::new(fields[0], fields[1], date), acc)?;
    }

    Ok(ConsolidatedState::from_parts(entries, BTreeSet::new()))
}

fn insert_unique(
    entries: &mut BTreeMap<GroupKey, Accumulator>,
    key: GroupKey,
    acc: Accumulator,
) -> Result<()> {
    if entries.contains_key(&key) {
        return Err(FlowError::MalformedSnapshot(format!(
            "duplicate entry for {}",
            key
        )));
    }
    entries.insert(key, acc);
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
