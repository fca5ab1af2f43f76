//! Snapshot persistence with optimistic versioning.
//!
//! A store keeps, per tag, a "latest" snapshot and an immutable timestamped
//! copy of every version ever saved. `save` succeeds only when the caller's
//! expected version is still current; otherwise it reports the version that
//! won so the caller can reload, re-merge and retry.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use flowstat_core::error::{FlowError, Result};
use flowstat_core::settings::{validate_tag, DEFAULT_TAG};
use flowstat_core::state::ConsolidatedState;
use flowstat_core::time_utils::archive_stamp;
use flowstat_data::snapshot::{self, SnapshotMeta};
use fs2::FileExt;
use tracing::{debug, info, warn};

// ── Versions and outcomes ─────────────────────────────────────────────────────

/// Monotonic snapshot version. [`SnapshotVersion::ABSENT`] means "no
/// snapshot has been saved under this tag yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion(u64);

impl SnapshotVersion {
    pub const ABSENT: SnapshotVersion = SnapshotVersion(0);

    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn is_absent(&self) -> bool {
        self.0 == 0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A loaded state together with the version it was read at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedSnapshot {
    pub state: ConsolidatedState,
    pub version: SnapshotVersion,
}

/// Result of a conditional save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The snapshot is now "latest"; `archive` names its immutable copy.
    Saved {
        version: SnapshotVersion,
        archive: String,
    },
    /// Another writer saved first. Nothing was written.
    Conflict { current: SnapshotVersion },
}

// ── SnapshotStore ─────────────────────────────────────────────────────────────

/// Durable home of consolidated snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Load "latest" for `tag`. An absent snapshot is the empty state at
    /// [`SnapshotVersion::ABSENT`], not an error.
    fn load(&self, tag: Option<&str>) -> Result<LoadedSnapshot>;

    /// Publish `state` as the new "latest" if the current version still
    /// equals `expected`. All-or-nothing.
    fn save(
        &self,
        state: &ConsolidatedState,
        expected: SnapshotVersion,
        tag: Option<&str>,
    ) -> Result<SaveOutcome>;
}

/// The effective tag: `DEFAULT_TAG` when none is given, validated otherwise.
pub fn resolve_tag(tag: Option<&str>) -> Result<&str> {
    let tag = tag.unwrap_or(DEFAULT_TAG);
    validate_tag(tag)?;
    Ok(tag)
}

// ── FsSnapshotStore ───────────────────────────────────────────────────────────

/// Filesystem store rooted at a data directory.
///
/// Layout per tag:
///
/// ```text
/// <root>/consolidated/<tag>/latest.json
/// <root>/consolidated/<tag>/latest.csv
/// <root>/consolidated/<tag>/history/aggregates_<stamp>_v<N>.{json,csv}
/// <root>/consolidated/<tag>/.lock
/// ```
///
/// `latest.json` is the committed snapshot. `latest.csv` is a view derived
/// from it and may lag one version behind after a crash mid-save.
///
/// Saves hold an exclusive advisory lock on `.lock`. The operating system
/// releases it when the holder's handle closes, including when the process
/// dies, so a leftover `.lock` file never blocks later writers.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn tag_dir(&self, tag: Option<&str>) -> Result<PathBuf> {
        Ok(self.root.join("consolidated").join(resolve_tag(tag)?))
    }

    /// Immutable JSON copies for `tag`, oldest first.
    pub fn archives(&self, tag: Option<&str>) -> Result<Vec<PathBuf>> {
        let history = self.tag_dir(tag)?.join("history");
        let entries = match std::fs::read_dir(&history) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(FlowError::Storage {
                    path: history,
                    source,
                })
            }
        };

        let mut archives: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        archives.sort();
        Ok(archives)
    }

    fn read_latest(&self, dir: &Path) -> Result<LoadedSnapshot> {
        let path = dir.join("latest.json");
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot at {}; starting empty", path.display());
                return Ok(LoadedSnapshot::default());
            }
            Err(source) => return Err(FlowError::Storage { path, source }),
        };

        let (state, version) = snapshot::decode_json(&bytes)?;
        Ok(LoadedSnapshot {
            state,
            version: SnapshotVersion::new(version),
        })
    }

    /// Take the tag's save lock without waiting. A held lock is
    /// [`FlowError::StorageBusy`], which the cycle retries.
    fn acquire_lock(&self, dir: &Path) -> Result<LockGuard> {
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| FlowError::Storage {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockGuard { file, path }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(FlowError::StorageBusy(path))
            }
            Err(source) => Err(FlowError::Storage { path, source }),
        }
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn load(&self, tag: Option<&str>) -> Result<LoadedSnapshot> {
        let dir = self.tag_dir(tag)?;
        self.read_latest(&dir)
    }

    fn save(
        &self,
        state: &ConsolidatedState,
        expected: SnapshotVersion,
        tag: Option<&str>,
    ) -> Result<SaveOutcome> {
        let tag = resolve_tag(tag)?;
        let dir = self.tag_dir(Some(tag))?;
        let history = dir.join("history");
        std::fs::create_dir_all(&history).map_err(|source| FlowError::Storage {
            path: history.clone(),
            source,
        })?;

        let _lock = self.acquire_lock(&dir)?;

        let current = self.read_latest(&dir)?.version;
        if current != expected {
            debug!(tag, %expected, %current, "snapshot moved on; not saving");
            return Ok(SaveOutcome::Conflict { current });
        }

        let version = current.next();
        let now = Utc::now();
        let meta = SnapshotMeta {
            version: version.get(),
            tag: tag.to_string(),
            generated_at: now,
        };
        let json = snapshot::encode_json(state, &meta)?;
        let csv = snapshot::encode_csv(state);

        // Immutable copies first: "latest" must never point past history.
        let stem = format!("aggregates_{}_v{}", archive_stamp(now), version.get());
        let archive = history.join(format!("{}.json", stem));
        write_atomic(&history.join(format!("{}.csv", stem)), &csv)?;
        write_atomic(&archive, &json)?;

        // latest.json commits the version; latest.csv only mirrors it.
        write_atomic(&dir.join("latest.json"), &json)?;
        write_atomic(&dir.join("latest.csv"), &csv)?;

        info!(
            tag,
            %version,
            entries = state.len(),
            "Saved snapshot {}",
            archive.display()
        );
        Ok(SaveOutcome::Saved {
            version,
            archive: archive.display().to_string(),
        })
    }
}

/// Holds the advisory lock until dropped. The file itself stays in place.
struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Write to a hidden temp file in the same directory, then rename over `path`.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let storage = |source| FlowError::Storage {
        path: path.to_path_buf(),
        source,
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", name));
    std::fs::write(&tmp, contents).map_err(storage)?;
    std::fs::rename(&tmp, path).map_err(storage)
}

// ── MemorySnapshotStore ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TagHistory {
    versions: Vec<ConsolidatedState>,
}

impl TagHistory {
    fn current(&self) -> SnapshotVersion {
        SnapshotVersion::new(self.versions.len() as u64)
    }
}

/// In-process store. Thread-safe via `RwLock`; history is kept in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    tags: RwLock<HashMap<String, TagHistory>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of versions saved under `tag`.
    pub fn history_len(&self, tag: Option<&str>) -> Result<usize> {
        let tag = resolve_tag(tag)?;
        let tags = self.tags.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tags.get(tag).map(|h| h.versions.len()).unwrap_or(0))
    }

    /// The immutable copy saved as `version`, if any.
    pub fn archived(
        &self,
        version: SnapshotVersion,
        tag: Option<&str>,
    ) -> Result<Option<ConsolidatedState>> {
        let tag = resolve_tag(tag)?;
        let tags = self.tags.read().unwrap_or_else(PoisonError::into_inner);
        let index = (version.get() as usize).checked_sub(1);
        Ok(tags
            .get(tag)
            .zip(index)
            .and_then(|(h, i)| h.versions.get(i).cloned()))
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, tag: Option<&str>) -> Result<LoadedSnapshot> {
        let tag = resolve_tag(tag)?;
        let tags = self.tags.read().unwrap_or_else(PoisonError::into_inner);
        Ok(match tags.get(tag) {
            Some(history) => LoadedSnapshot {
                state: history.versions.last().cloned().unwrap_or_default(),
                version: history.current(),
            },
            None => LoadedSnapshot::default(),
        })
    }

    fn save(
        &self,
        state: &ConsolidatedState,
        expected: SnapshotVersion,
        tag: Option<&str>,
    ) -> Result<SaveOutcome> {
        let tag = resolve_tag(tag)?;
        state.ensure_finite()?;
        let mut tags = self.tags.write().unwrap_or_else(PoisonError::into_inner);
        let history = tags.entry(tag.to_string()).or_default();

        let current = history.current();
        if current != expected {
            return Ok(SaveOutcome::Conflict { current });
        }

        history.versions.push(state.clone());
        let version = history.current();
        Ok(SaveOutcome::Saved {
            version,
            archive: format!("memory:{}/{}", tag, version),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
