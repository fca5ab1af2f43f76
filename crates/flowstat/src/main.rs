mod bootstrap;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use flowstat_core::settings::{Command, Settings};
use flowstat_core::state::PartialBatch;
use flowstat_core::time_utils::DateResolver;
use flowstat_data::export::{export, export_file_name, render_csv, PairFilter};
use flowstat_data::extractor::{ColumnKind, Extractor, RecordSchema};
use flowstat_data::reader::collect_inputs;
use flowstat_data::snapshot::encode_csv;
use flowstat_data::summary::read_summary_file;
use flowstat_runtime::cycle::{CancelToken, ConsolidationCycle, CycleReport, RetryPolicy};
use flowstat_runtime::store::{FsSnapshotStore, SnapshotStore};
use flowstat_runtime::summarizer::Summarizer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load_with_last_used();

    bootstrap::ensure_directories()?;
    bootstrap::setup_logging(&settings.log_level, settings.log_file.as_ref())?;

    tracing::info!("flowstat v{} starting", env!("CARGO_PKG_VERSION"));

    let data_dir = settings.require_data_dir()?.to_path_buf();
    let tag = settings.snapshot_tag()?.to_string();
    bootstrap::ensure_data_layout(&data_dir)?;
    tracing::info!("Data dir: {}, tag: {}, timezone: {}", data_dir.display(), tag, settings.timezone);

    let ctx = RunContext {
        store: Arc::new(FsSnapshotStore::new(&data_dir)),
        data_dir,
        tag,
        cancel: CancelToken::new(),
        settings,
    };

    // A cancelled consolidation finishes its current step but never publishes.
    tokio::select! {
        result = ctx.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received; cancelling");
            ctx.cancel.cancel();
            bail!("interrupted");
        }
    }

    Ok(())
}

struct RunContext {
    settings: Settings,
    data_dir: PathBuf,
    tag: String,
    store: Arc<FsSnapshotStore>,
    cancel: CancelToken,
}

impl RunContext {
    async fn run(&self) -> Result<()> {
        match &self.settings.command {
            Command::Summarize {
                inputs,
                metric_column,
            } => {
                let (_, failed) = self.summarize(inputs, *metric_column).await?;
                if failed > 0 {
                    bail!("{} input file(s) could not be summarised", failed);
                }
            }

            Command::Consolidate { summaries } => {
                let dirs = self.or_default(summaries, "summaries");
                let files = collect_inputs(&dirs);
                if files.is_empty() {
                    warn!("No summary files found");
                    return Ok(());
                }

                let mut batches = Vec::with_capacity(files.len());
                let mut failed = 0;
                for file in &files {
                    match read_summary_file(file) {
                        Ok(batch) => batches.push(batch),
                        Err(e) => {
                            warn!("Skipping {}: {}", file.display(), e);
                            failed += 1;
                        }
                    }
                }

                let report = self.consolidate(batches).await?;
                print_cycle(&report);
                if failed > 0 {
                    bail!("{} summary file(s) could not be read", failed);
                }
            }

            Command::Ingest {
                inputs,
                metric_column,
            } => {
                let (batches, failed) = self.summarize(inputs, *metric_column).await?;
                let report = self.consolidate(batches).await?;
                print_cycle(&report);
                if failed > 0 {
                    bail!("{} input file(s) could not be summarised", failed);
                }
            }

            Command::Export { src, dst, output } => {
                let loaded = self.store.load(Some(self.tag.as_str()))?;
                let result = export(&loaded.state, &PairFilter::new(src.as_str(), dst.as_str()));
                let path = output.clone().unwrap_or_else(|| {
                    self.data_dir.join("exports").join(export_file_name(src, dst))
                });
                write_output(&path, &render_csv(&result))?;
                println!(
                    "Exported {} row(s) for {} -> {} to {}",
                    result.len(),
                    src,
                    dst,
                    path.display()
                );
            }

            Command::Show => {
                let loaded = self.store.load(Some(self.tag.as_str()))?;
                info!("Snapshot {} with {} entries", loaded.version, loaded.state.len());
                print!("{}", encode_csv(&loaded.state));
            }
        }

        Ok(())
    }

    fn or_default(&self, paths: &[PathBuf], sub: &str) -> Vec<PathBuf> {
        if paths.is_empty() {
            vec![self.data_dir.join(sub)]
        } else {
            paths.to_vec()
        }
    }

    fn extractor(&self, metric_column: Option<usize>) -> Extractor {
        let mut schema = RecordSchema::flow_records();
        if let Some(index) = metric_column {
            schema = schema.with_metric(index, ColumnKind::Float);
        }
        Extractor::new(schema, DateResolver::new(&self.settings.timezone))
            .with_delimiter(self.settings.delimiter)
    }

    /// Summarise raw inputs, returning the written batches and the number of
    /// inputs that failed.
    async fn summarize(
        &self,
        inputs: &[PathBuf],
        metric_column: Option<usize>,
    ) -> Result<(Vec<PartialBatch>, usize)> {
        let files = collect_inputs(&self.or_default(inputs, "incoming"));
        if files.is_empty() {
            warn!("No input files found");
            return Ok((Vec::new(), 0));
        }

        let summarizer = Summarizer::new(
            self.extractor(metric_column),
            self.data_dir.join("summaries"),
        );
        let outcomes = summarizer.summarize_all(files).await;

        let mut batches = Vec::new();
        let mut failed = 0;
        for outcome in outcomes {
            match outcome.result {
                Ok(unit) => {
                    println!(
                        "{} -> {} ({} keys, {} rows, {} rejected)",
                        outcome.input.display(),
                        unit.summary_path.display(),
                        unit.batch.len(),
                        unit.rows_read,
                        unit.rejected
                    );
                    for sample in &unit.samples {
                        warn!(
                            "{}:{}: {}",
                            outcome.input.display(),
                            sample.line,
                            sample.reason
                        );
                    }
                    batches.push(unit.batch);
                }
                Err(e) => {
                    eprintln!("{}: {}", outcome.input.display(), e);
                    failed += 1;
                }
            }
        }
        Ok((batches, failed))
    }

    /// Run one consolidation cycle on the blocking pool.
    async fn consolidate(&self, batches: Vec<PartialBatch>) -> Result<CycleReport> {
        let store: Arc<dyn SnapshotStore> = self.store.clone();
        let cycle = ConsolidationCycle::new(store)
            .with_tag(self.tag.clone())
            .with_policy(RetryPolicy {
                max_attempts: self.settings.max_attempts,
                ..RetryPolicy::default()
            })
            .with_cancel(self.cancel.clone());

        let report = tokio::task::spawn_blocking(move || cycle.run(&batches))
            .await
            .context("consolidation task failed")??;
        Ok(report)
    }
}

fn print_cycle(report: &CycleReport) {
    match (&report.saved, &report.archive) {
        (Some(version), Some(archive)) => println!(
            "Merged {} batch(es), skipped {} duplicate(s); snapshot {} ({} entries) saved as {}",
            report.merge.applied.len(),
            report.merge.duplicates.len(),
            version,
            report.entries,
            archive
        ),
        _ => println!(
            "Nothing new to merge ({} duplicate batch(es)); snapshot unchanged",
            report.merge.duplicates.len()
        ),
    }
}

fn write_output(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
