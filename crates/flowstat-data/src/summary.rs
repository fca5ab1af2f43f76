//! On-disk form of a [`PartialBatch`]: one `Src,Dst,Date,Total` row per key.
//!
//! A summary file's name doubles as its [`BatchId`], so re-delivering the
//! same file to the consolidator is recognised as a duplicate.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flowstat_core::error::{FlowError, Result};
use flowstat_core::state::{BatchId, PartialBatch};
use flowstat_core::time_utils::{format_date, DateResolver};
use regex::Regex;
use tracing::{debug, warn};

use crate::delimited;
use crate::extractor::{Extractor, RecordSchema};

pub const SUMMARY_HEADER: [&str; 4] = ["Src", "Dst", "Date", "Total"];

fn csv_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.csv$").expect("regex is valid"))
}

/// Summary file name for a raw input: `day1.csv` becomes `day1_summary.csv`.
pub fn summary_file_name(input: &Path) -> String {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}_summary.csv", csv_suffix().replace(&name, ""))
}

/// The batch id a summary file is merged under.
pub fn batch_id_for(path: &Path) -> BatchId {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    BatchId::new(name)
}

/// Render a batch as delimited text, rows in key order.
pub fn encode(batch: &PartialBatch) -> String {
    let mut out = String::new();
    delimited::write_record(&mut out, &SUMMARY_HEADER, ',');
    for (key, total) in batch.iter() {
        delimited::write_record(
            &mut out,
            &[
                key.source().to_string(),
                key.destination().to_string(),
                format_date(key.date()),
                total.to_string(),
            ],
            ',',
        );
    }
    out
}

/// Parse a summary file body into a batch with the given id.
///
/// Malformed rows are skipped and logged; they never abort the batch.
pub fn decode(id: impl Into<BatchId>, bytes: &[u8]) -> PartialBatch {
    let id = id.into();
    let extraction = Extractor::new(RecordSchema::partial_summary(), DateResolver::default())
        .extract_bytes(bytes);
    if extraction.rejected > 0 {
        warn!(
            "Summary {}: skipped {} malformed rows",
            id, extraction.rejected
        );
        for sample in &extraction.samples {
            debug!("  line {}: {} ({:?})", sample.line, sample.reason, sample.raw);
        }
    }
    extraction.into_batch(id)
}

pub fn read_summary_file(path: &Path) -> Result<PartialBatch> {
    let bytes = std::fs::read(path).map_err(|source| FlowError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decode(batch_id_for(path), &bytes))
}

/// Write `batch` to `dir/name`, atomically.
pub fn write_summary_file(dir: &Path, name: &str, batch: &PartialBatch) -> Result<PathBuf> {
    let path = dir.join(name);
    let storage = |source| FlowError::Storage {
        path: path.clone(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(storage)?;
    let tmp = dir.join(format!(".{}.tmp", name));
    std::fs::write(&tmp, encode(batch)).map_err(storage)?;
    std::fs::rename(&tmp, &path).map_err(storage)?;

    debug!("Wrote summary {} ({} keys)", path.display(), batch.len());
    Ok(path)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use flowstat_core::key::GroupKey;
    use tempfile::TempDir;

    fn key(src: &str, dst: &str, day: u32) -> GroupKey {
        GroupKey::new(src, dst, NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
    }

    #[test]
    fn test_summary_file_name() {
        assert_eq!(summary_file_name(Path::new("in/day1.csv")), "day1_summary.csv");
        assert_eq!(summary_file_name(Path::new("DAY2.CSV")), "DAY2_summary.csv");
        assert_eq!(summary_file_name(Path::new("flows.txt")), "flows.txt_summary.csv");
    }

    #[test]
    fn test_encode_is_sorted_with_header() {
        let mut batch = PartialBatch::new("b");
        batch.add(key("B", "A", 1), 2.0);
        batch.add(key("A", "B", 2), 80.0);
        batch.add(key("A", "B", 1), 150.5);

        assert_eq!(
            encode(&batch),
            "Src,Dst,Date,Total\nA,B,2024-01-01,150.5\nA,B,2024-01-02,80\nB,A,2024-01-01,2\n"
        );
    }

    #[test]
    fn test_decode_reads_encoded_batch() {
        let mut batch = PartialBatch::new("day1_summary.csv");
        batch.add(key("10.0.0.1", "10.0.0.2", 3), 0.1 + 0.2);
        batch.add(key("a,b", "c", 4), -7.25);

        let decoded = decode("day1_summary.csv", encode(&batch).as_bytes());
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_decode_skips_malformed_rows() {
        let text = "Src,Dst,Date,Total\nA,B,2024-01-01,1\nA,B\nA,B,2024-01-02,oops\n";
        let batch = decode("x", text.as_bytes());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get(&key("A", "B", 1)), Some(1.0));
    }

    #[test]
    fn test_write_then_read_uses_file_name_as_id() {
        let tmp = TempDir::new().expect("tempdir");
        let mut batch = PartialBatch::new("day1_summary.csv");
        batch.add(key("A", "B", 1), 150.5);

        let path = write_summary_file(tmp.path(), "day1_summary.csv", &batch).expect("write");
        assert!(path.ends_with("day1_summary.csv"));

        let read = read_summary_file(&path).expect("read");
        assert_eq!(read.id().as_str(), "day1_summary.csv");
        assert_eq!(read, batch);
    }

    #[test]
    fn test_read_missing_summary_is_error() {
        let tmp = TempDir::new().expect("tempdir");
        let err = read_summary_file(&tmp.path().join("nope.csv")).unwrap_err();
        assert!(matches!(err, FlowError::FileRead { .. }));
    }
}
