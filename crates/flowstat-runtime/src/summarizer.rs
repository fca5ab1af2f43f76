//! Parallel summarisation of raw input files.
//!
//! Every input unit is extracted on the blocking pool and written out as its
//! own summary file, with at most `concurrency` units in flight. A unit that
//! fails is reported in its [`UnitOutcome`]; it never stops the others.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use flowstat_core::error::{FlowError, Result};
use flowstat_core::state::PartialBatch;
use flowstat_data::extractor::{Extractor, RejectedRow};
use flowstat_data::summary::{summary_file_name, write_summary_file};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default number of input units extracted at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// A unit that was summarised successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSummary {
    pub summary_path: PathBuf,
    /// The batch as written; its id is the summary file name.
    pub batch: PartialBatch,
    pub rows_read: usize,
    pub rejected: usize,
    pub samples: Vec<RejectedRow>,
}

#[derive(Debug)]
pub struct UnitOutcome {
    pub input: PathBuf,
    pub result: Result<UnitSummary>,
}

/// Extracts raw files into summary files under `output_dir`.
#[derive(Debug, Clone)]
pub struct Summarizer {
    extractor: Arc<Extractor>,
    output_dir: PathBuf,
    concurrency: usize,
}

impl Summarizer {
    pub fn new(extractor: Extractor, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            extractor: Arc::new(extractor),
            output_dir: output_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Summarise every input, returning one outcome per input sorted by path.
    pub async fn summarize_all(&self, inputs: Vec<PathBuf>) -> Vec<UnitOutcome> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for input in inputs {
            let permits = permits.clone();
            let extractor = self.extractor.clone();
            let output_dir = self.output_dir.clone();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let path = input.clone();
                let result =
                    tokio::task::spawn_blocking(move || summarize_one(&extractor, &path, &output_dir))
                        .await
                        .unwrap_or_else(|e| {
                            Err(FlowError::Other(anyhow::anyhow!(
                                "summariser task failed: {}",
                                e
                            )))
                        });
                UnitOutcome { input, result }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "summariser task aborted"),
            }
        }
        outcomes.sort_by(|a, b| a.input.cmp(&b.input));

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(
            units = outcomes.len(),
            failed,
            "summarised input files"
        );
        outcomes
    }
}

fn summarize_one(extractor: &Extractor, input: &Path, output_dir: &Path) -> Result<UnitSummary> {
    let extraction = extractor.extract_file(input)?;
    let name = summary_file_name(input);
    let rows_read = extraction.rows_read;
    let rejected = extraction.rejected;
    let samples = extraction.samples.clone();

    let batch = extraction.into_batch(name.as_str());
    let summary_path = write_summary_file(output_dir, &name, &batch)?;
    debug!(
        "{} -> {} ({} keys)",
        input.display(),
        summary_path.display(),
        batch.len()
    );

    Ok(UnitSummary {
        summary_path,
        batch,
        rows_read,
        rejected,
        samples,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use flowstat_core::key::GroupKey;
    use flowstat_core::time_utils::DateResolver;
    use flowstat_data::extractor::RecordSchema;
    use flowstat_data::summary::read_summary_file;
    use tempfile::TempDir;

    fn key(src: &str, dst: &str, day: u32) -> GroupKey {
        GroupKey::new(src, dst, NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
    }

    fn summarizer(out: &Path) -> Summarizer {
        Summarizer::new(
            Extractor::new(RecordSchema::partial_summary(), DateResolver::default()),
            out,
        )
        .with_concurrency(2)
    }

    #[tokio::test]
    async fn test_summarize_all_writes_one_summary_per_input() {
        let tmp = TempDir::new().unwrap();
        let incoming = tmp.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(
            incoming.join("day1.csv"),
            "Src,Dst,Date,Total\nA,B,2024-01-01,100.5\nA,B,2024-01-01,50.0\nbad\n",
        )
        .unwrap();
        std::fs::write(incoming.join("day2.csv"), "A,B,2024-01-01,80\n").unwrap();

        let out = tmp.path().join("summaries");
        let outcomes = summarizer(&out)
            .summarize_all(vec![incoming.join("day2.csv"), incoming.join("day1.csv")])
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].input, incoming.join("day1.csv"));

        let day1 = outcomes[0].result.as_ref().unwrap();
        assert_eq!(day1.summary_path, out.join("day1_summary.csv"));
        assert_eq!(day1.batch.id().as_str(), "day1_summary.csv");
        assert_eq!(day1.batch.get(&key("A", "B", 1)), Some(150.5));
        assert_eq!(day1.rows_read, 3);
        assert_eq!(day1.rejected, 1);
        assert_eq!(day1.samples.len(), 1);

        let reread = read_summary_file(&day1.summary_path).unwrap();
        assert_eq!(reread, day1.batch);
    }

    #[tokio::test]
    async fn test_failed_unit_does_not_stop_others() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.csv");
        std::fs::write(&good, "A,B,2024-01-02,1\n").unwrap();
        let missing = tmp.path().join("missing.csv");

        let outcomes = summarizer(&tmp.path().join("out"))
            .summarize_all(vec![missing.clone(), good.clone()])
            .await;

        assert_eq!(outcomes.len(), 2);
        let by_input = |p: &Path| outcomes.iter().find(|o| o.input == p).unwrap();
        assert!(matches!(
            by_input(missing.as_path()).result,
            Err(FlowError::FileRead { .. })
        ));
        assert_eq!(
            by_input(good.as_path()).result.as_ref().unwrap().batch.get(&key("A", "B", 2)),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_no_inputs() {
        let tmp = TempDir::new().unwrap();
        assert!(summarizer(tmp.path()).summarize_all(Vec::new()).await.is_empty());
    }
}
