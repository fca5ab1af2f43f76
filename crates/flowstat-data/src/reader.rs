//! Input discovery: expands files and directories into the delimited files
//! to process.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

// ── Public API ────────────────────────────────────────────────────────────────

/// Find all `.csv` files recursively under `data_path`, sorted by path.
///
/// Hidden files (including in-flight `.tmp` writes) are skipped.
pub fn find_csv_files(data_path: &Path) -> Vec<PathBuf> {
    if !data_path.exists() {
        warn!("Data path does not exist: {}", data_path.display());
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(data_path)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && !is_hidden(entry.path())
                && entry
                    .path()
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

/// Expand a mix of files and directories into a sorted, de-duplicated list.
///
/// Explicit files are kept whatever their extension; directories contribute
/// their `.csv` files. Paths that do not exist are logged and skipped.
pub fn collect_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen: BTreeSet<PathBuf> = BTreeSet::new();

    for input in inputs {
        if input.is_dir() {
            seen.extend(find_csv_files(input));
        } else if input.is_file() {
            seen.insert(input.clone());
        } else {
            warn!("Input does not exist: {}", input.display());
        }
    }

    debug!("Collected {} input files", seen.len());
    seen.into_iter().collect()
}

// ── Internal helpers ──────────────────────────────────────────────────────────

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
