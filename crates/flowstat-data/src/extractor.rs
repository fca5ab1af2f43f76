//! Turns delimited flow records into per-key totals for one input unit.
//!
//! Which columns hold the key and the metric is described by a
//! [`RecordSchema`]. Rows that do not fit the schema are counted and sampled,
//! never fatal: one bad row must not cost the rest of the batch.

use std::collections::BTreeMap;
use std::path::Path;

use flowstat_core::accumulator::Accumulator;
use flowstat_core::error::{FlowError, Result};
use flowstat_core::key::GroupKey;
use flowstat_core::state::{BatchId, PartialBatch};
use flowstat_core::time_utils::DateResolver;
use thiserror::Error;
use tracing::{debug, warn};

use crate::delimited::{self, Record};

/// At most this many rejected rows are kept verbatim per extraction.
pub const MAX_REJECTED_SAMPLES: usize = 10;

// ── Schema ────────────────────────────────────────────────────────────────────

/// Expected type of a column's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Date,
    Float,
    Integer,
}

/// A named, positioned column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub index: usize,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, index: usize, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            index,
            kind,
        }
    }
}

/// Layout of one record type: where the key and metric live, which other
/// columns must be present and well-formed, and how a header row looks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    source: Column,
    destination: Column,
    date: Column,
    metric: Column,
    required: Vec<Column>,
    header_tokens: Vec<String>,
}

impl RecordSchema {
    pub fn new(source: usize, destination: usize, date: usize, metric: Column) -> Self {
        Self {
            source: Column::new("source", source, ColumnKind::Text),
            destination: Column::new("destination", destination, ColumnKind::Text),
            date: Column::new("date", date, ColumnKind::Date),
            metric,
            required: Vec::new(),
            header_tokens: Vec::new(),
        }
    }

    /// Raw flow exports (CICFlowMeter layout): source IP, destination IP,
    /// timestamp, flow duration as the metric, and forward packet count.
    pub fn flow_records() -> Self {
        Self::new(1, 3, 6, Column::new("flow_duration", 7, ColumnKind::Float))
            .with_required(Column::new("total_fwd_packets", 8, ColumnKind::Integer))
            .with_header_tokens(["flow id", "src", "source", "dst", "destination", "date"])
    }

    /// Partial summary files: `Src,Dst,Date,Total`.
    pub fn partial_summary() -> Self {
        Self::new(0, 1, 2, Column::new("total", 3, ColumnKind::Float))
            .with_header_tokens(["src", "source", "date", "dst", "destination"])
    }

    /// Replace the summed metric column.
    pub fn with_metric(mut self, index: usize, kind: ColumnKind) -> Self {
        self.metric = Column::new(format!("column_{}", index), index, kind);
        self
    }

    /// Add a column that must be present and parse as its kind.
    pub fn with_required(mut self, column: Column) -> Self {
        self.required.push(column);
        self
    }

    pub fn with_header_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.header_tokens = tokens
            .into_iter()
            .map(|t| t.into().to_lowercase())
            .collect();
        self
    }

    /// Smallest field count a row needs to be considered at all.
    pub fn min_fields(&self) -> usize {
        self.columns().map(|c| c.index + 1).max().unwrap_or(0)
    }

    /// `true` when `first_field` looks like a header cell.
    pub fn is_header(&self, first_field: &str) -> bool {
        let cell = first_field.trim().to_lowercase();
        self.header_tokens.iter().any(|t| cell.contains(t.as_str()))
    }

    fn columns(&self) -> impl Iterator<Item = &Column> {
        [&self.source, &self.destination, &self.date, &self.metric]
            .into_iter()
            .chain(self.required.iter())
    }
}

// ── Rejections ────────────────────────────────────────────────────────────────

/// Why a row was skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("expected at least {expected} fields, found {found}")]
    TooFewFields { expected: usize, found: usize },

    #[error("field {column} is empty")]
    EmptyField { column: String },

    #[error("field {column} is not a date: {value:?}")]
    InvalidDate { column: String, value: String },

    #[error("field {column} is not a finite number: {value:?}")]
    InvalidFloat { column: String, value: String },

    #[error("field {column} pushes the total for its key out of range")]
    TotalOutOfRange { column: String },

    #[error("field {column} is not an integer: {value:?}")]
    InvalidInteger { column: String, value: String },
}

/// A sampled rejected row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub line: usize,
    pub reason: RejectReason,
    pub raw: String,
}

// ── Extraction ────────────────────────────────────────────────────────────────

/// Result of extracting one input unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Sum of the metric per key over every accepted row.
    pub totals: BTreeMap<GroupKey, f64>,
    /// Non-blank data rows seen, header excluded.
    pub rows_read: usize,
    pub header_skipped: bool,
    pub rejected: usize,
    /// The first [`MAX_REJECTED_SAMPLES`] rejections.
    pub samples: Vec<RejectedRow>,
}

impl Extraction {
    pub fn accepted(&self) -> usize {
        self.rows_read - self.rejected
    }

    pub fn into_batch(self, id: impl Into<BatchId>) -> PartialBatch {
        PartialBatch::from_totals(id, self.totals)
    }

    fn reject(&mut self, record: &Record, reason: RejectReason) {
        self.rejected += 1;
        if self.samples.len() < MAX_REJECTED_SAMPLES {
            self.samples.push(RejectedRow {
                line: record.line,
                reason,
                raw: record.raw.clone(),
            });
        }
    }
}

// ── Extractor ─────────────────────────────────────────────────────────────────

/// Applies a [`RecordSchema`] to delimited text.
#[derive(Debug, Clone)]
pub struct Extractor {
    schema: RecordSchema,
    dates: DateResolver,
    delimiter: char,
}

impl Extractor {
    pub fn new(schema: RecordSchema, dates: DateResolver) -> Self {
        Self {
            schema,
            dates,
            delimiter: ',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Read and extract a whole file.
    pub fn extract_file(&self, path: &Path) -> Result<Extraction> {
        let bytes = std::fs::read(path).map_err(|source| FlowError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let extraction = self.extract_bytes(&bytes);
        debug!(
            "Extracted {} keys from {} ({} rows, {} rejected)",
            extraction.totals.len(),
            path.display(),
            extraction.rows_read,
            extraction.rejected
        );
        if extraction.rejected > 0 {
            warn!(
                "{}: rejected {} of {} rows",
                path.display(),
                extraction.rejected,
                extraction.rows_read
            );
        }
        Ok(extraction)
    }

    pub fn extract_bytes(&self, bytes: &[u8]) -> Extraction {
        self.extract_text(&delimited::decode(bytes))
    }

    pub fn extract_text(&self, text: &str) -> Extraction {
        self.extract_records(delimited::parse(text, self.delimiter))
    }

    /// Extract already-split records.
    ///
    /// Blank records are ignored. Only the first non-blank record is checked
    /// against the schema's header tokens.
    pub fn extract_records<I>(&self, records: I) -> Extraction
    where
        I: IntoIterator<Item = Record>,
    {
        let mut out = Extraction::default();
        let mut first = true;

        for record in records {
            if record.is_blank() {
                continue;
            }
            if std::mem::take(&mut first) {
                let lead = record.fields.first().map(String::as_str).unwrap_or("");
                if self.schema.is_header(lead) {
                    out.header_skipped = true;
                    continue;
                }
            }

            out.rows_read += 1;
            match self.parse_row(&record) {
                Ok((key, value)) => {
                    let total = out.totals.get(&key).copied().unwrap_or(0.0) + value;
                    // Each total becomes one merge sample, so its square must stay finite too.
                    if Accumulator::sample(total).is_finite() {
                        out.totals.insert(key, total);
                    } else {
                        let column = self.schema.metric.name.clone();
                        out.reject(&record, RejectReason::TotalOutOfRange { column });
                    }
                }
                Err(reason) => out.reject(&record, reason),
            }
        }

        out
    }

    fn parse_row(&self, record: &Record) -> std::result::Result<(GroupKey, f64), RejectReason> {
        let expected = self.schema.min_fields();
        if record.fields.len() < expected {
            return Err(RejectReason::TooFewFields {
                expected,
                found: record.fields.len(),
            });
        }

        let source = self.text(record, &self.schema.source)?;
        let destination = self.text(record, &self.schema.destination)?;
        let date_text = self.text(record, &self.schema.date)?;
        let date = self
            .dates
            .resolve(date_text)
            .ok_or_else(|| RejectReason::InvalidDate {
                column: self.schema.date.name.clone(),
                value: date_text.to_string(),
            })?;
        let value = self.number(record, &self.schema.metric)?;

        for column in &self.schema.required {
            self.check(record, column)?;
        }

        Ok((GroupKey::new(source, destination, date), value))
    }

    fn text<'r>(
        &self,
        record: &'r Record,
        column: &Column,
    ) -> std::result::Result<&'r str, RejectReason> {
        let value = record.fields[column.index].trim();
        if value.is_empty() {
            return Err(RejectReason::EmptyField {
                column: column.name.clone(),
            });
        }
        Ok(value)
    }

    fn number(&self, record: &Record, column: &Column) -> std::result::Result<f64, RejectReason> {
        let value = self.text(record, column)?;
        match column.kind {
            ColumnKind::Integer => value.parse::<i64>().map(|v| v as f64).map_err(|_| {
                RejectReason::InvalidInteger {
                    column: column.name.clone(),
                    value: value.to_string(),
                }
            }),
            _ => value
                .parse::<f64>()
                .ok()
                .filter(|v| Accumulator::sample(*v).is_finite())
                .ok_or_else(|| RejectReason::InvalidFloat {
                    column: column.name.clone(),
                    value: value.to_string(),
                }),
        }
    }

    fn check(&self, record: &Record, column: &Column) -> std::result::Result<(), RejectReason> {
        match column.kind {
            ColumnKind::Text => self.text(record, column).map(|_| ()),
            ColumnKind::Date => {
                let value = self.text(record, column)?;
                match self.dates.resolve(value) {
                    Some(_) => Ok(()),
                    None => Err(RejectReason::InvalidDate {
                        column: column.name.clone(),
                        value: value.to_string(),
                    }),
                }
            }
            ColumnKind::Float | ColumnKind::Integer => self.number(record, column).map(|_| ()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
