use std::path::PathBuf;
use thiserror::Error;

use crate::state::BatchId;

/// All errors produced by flowstat.
///
/// Malformed input rows are not errors: the extractor reports them as
/// rejection counts so a batch is never aborted by a single bad row.
#[derive(Error, Debug)]
pub enum FlowError {
    /// A file could not be opened or read from disk.
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// A required configuration value (data directory, tag, ...) is missing
    /// or invalid. Fatal for the cycle and never retried.
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    /// A load or save against the snapshot store failed with an I/O error.
    #[error("Storage failure at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another writer currently holds the snapshot lock.
    #[error("Snapshot store is busy: {0}")]
    StorageBusy(PathBuf),

    /// A persisted snapshot exists but cannot be decoded.
    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// A group's statistics overflowed and could not be read back once saved.
    #[error("Statistics out of range for {0}")]
    OutOfRange(String),

    /// Another writer persisted a newer snapshot since this caller loaded.
    #[error("Version conflict: expected v{expected}, found v{current}")]
    VersionConflict { expected: u64, current: u64 },

    /// The batch was already merged into this state's lineage.
    #[error("Batch {0} was already merged")]
    DuplicateBatch(BatchId),

    /// The retry budget of a consolidation cycle was used up.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    /// The cycle was cancelled before its snapshot was published.
    #[error("Consolidation cycle cancelled")]
    Cancelled,

    /// Pass-through for any raw I/O error that does not carry a path.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// `true` for failures that a retry of the whole cycle may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FlowError::Storage { .. }
                | FlowError::StorageBusy(_)
                | FlowError::VersionConflict { .. }
                | FlowError::Io(_)
        )
    }
}

/// Convenience alias used throughout the flowstat crates.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_file_read() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = FlowError::FileRead {
            path: PathBuf::from("/data/incoming/day1.csv"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to read file"));
        assert!(msg.contains("/data/incoming/day1.csv"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_error_display_missing_configuration() {
        let err = FlowError::MissingConfiguration("no data directory".to_string());
        assert_eq!(err.to_string(), "Missing configuration: no data directory");
    }

    #[test]
    fn test_error_display_version_conflict() {
        let err = FlowError::VersionConflict {
            expected: 3,
            current: 4,
        };
        assert_eq!(err.to_string(), "Version conflict: expected v3, found v4");
    }

    #[test]
    fn test_error_display_duplicate_batch() {
        let err = FlowError::DuplicateBatch(BatchId::new("day1_summary.csv"));
        assert_eq!(err.to_string(), "Batch day1_summary.csv was already merged");
    }

    #[test]
    fn test_error_display_retry_exhausted() {
        let err = FlowError::RetryExhausted {
            attempts: 3,
            last: "busy".to_string(),
        };
        assert_eq!(err.to_string(), "Gave up after 3 attempts: busy");
    }

    #[test]
    fn test_transient_classification() {
        let storage = FlowError::Storage {
            path: PathBuf::from("/x"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk"),
        };
        assert!(storage.is_transient());
        assert!(FlowError::StorageBusy(PathBuf::from("/x/.lock")).is_transient());
        assert!(FlowError::VersionConflict {
            expected: 1,
            current: 2
        }
        .is_transient());

        assert!(!FlowError::MissingConfiguration("tag".into()).is_transient());
        assert!(!FlowError::MalformedSnapshot("bad".into()).is_transient());
        assert!(!FlowError::OutOfRange("A→B@2024-01-01".into()).is_transient());
        assert!(!FlowError::Cancelled.is_transient());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: FlowError = io_err.into();
        assert!(err.to_string().contains("denied"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let err: FlowError = json_err.into();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }
}
