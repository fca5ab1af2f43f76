use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Sub-directories of a data directory, in pipeline order.
pub const DATA_LAYOUT: [&str; 4] = ["incoming", "summaries", "consolidated", "exports"];

// ── Directory bootstrap ────────────────────────────────────────────────────────

/// Ensure the `~/.flowstat/` directory (persisted settings, logs) exists.
pub fn ensure_directories() -> anyhow::Result<()> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let app_dir = home.join(".flowstat");
    std::fs::create_dir_all(&app_dir)?;
    std::fs::create_dir_all(app_dir.join("logs"))?;
    Ok(())
}

/// Create the standard layout under `data_dir` if absent.
pub fn ensure_data_layout(data_dir: &Path) -> anyhow::Result<()> {
    for sub in DATA_LAYOUT {
        std::fs::create_dir_all(data_dir.join(sub))?;
    }
    Ok(())
}

// ── Logging bootstrap ──────────────────────────────────────────────────────────

/// Map a `--log-level` value to an `EnvFilter` directive.
pub fn level_directive(log_level: &str) -> String {
    match log_level.to_uppercase().as_str() {
        "DEBUG" => "debug".to_string(),
        "INFO" => "info".to_string(),
        "WARNING" | "WARN" => "warn".to_string(),
        "ERROR" => "error".to_string(),
        other => other.to_lowercase(),
    }
}

/// Initialise the global `tracing` subscriber.
///
/// Logs go to stderr, or to `log_file` (appended, without ANSI colours)
/// when one is given. `RUST_LOG`, if set, overrides `log_level`.
pub fn setup_logging(log_level: &str, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(log_level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    let stderr_layer = match file_layer {
        Some(_) => None,
        None => Some(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_directories() {
        let tmp = TempDir::new().expect("tempdir");

        // Override HOME so that dirs::home_dir() resolves to our temp dir.
        let original_home = std::env::var_os("HOME");
        std::env::set_var("HOME", tmp.path());

        let result = ensure_directories();

        match original_home {
            Some(v) => std::env::set_var("HOME", v),
            None => std::env::remove_var("HOME"),
        }

        result.expect("ensure_directories should succeed");

        let app_dir = tmp.path().join(".flowstat");
        assert!(app_dir.is_dir(), ".flowstat dir must exist");
        assert!(app_dir.join("logs").is_dir(), "logs subdir must exist");
    }

    #[test]
    fn test_ensure_data_layout() {
        let tmp = TempDir::new().expect("tempdir");
        let data = tmp.path().join("data");

        ensure_data_layout(&data).expect("layout");
        ensure_data_layout(&data).expect("idempotent");

        for sub in DATA_LAYOUT {
            assert!(data.join(sub).is_dir(), "{sub} must exist");
        }
    }

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("info"), "info");
        assert_eq!(level_directive("WARNING"), "warn");
        assert_eq!(level_directive("ERROR"), "error");
        assert_eq!(level_directive("flowstat=trace"), "flowstat=trace");
    }
}
