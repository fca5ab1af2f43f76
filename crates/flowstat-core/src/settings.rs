use clap::{CommandFactory, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FlowError, Result};

/// Snapshot tag used when none is configured.
pub const DEFAULT_TAG: &str = "default";

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Incremental traffic-flow statistics: summarise raw flow exports and fold
/// them into a durable per-(source, destination, date) summary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "flowstat",
    about = "Incremental traffic-flow statistics",
    version
)]
pub struct Settings {
    /// Root directory holding incoming/, summaries/, consolidated/ and exports/
    #[arg(long, global = true, env = "FLOWSTAT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Snapshot tag (namespace for consolidated snapshots)
    #[arg(long, global = true)]
    pub tag: Option<String>,

    /// Timezone used to bucket offset timestamps into dates
    #[arg(long, global = true, default_value = "auto")]
    pub timezone: String,

    /// Field delimiter of raw record files
    #[arg(long, global = true, default_value = ",")]
    pub delimiter: char,

    /// Attempts per consolidation cycle before giving up (1-20)
    #[arg(long, global = true, default_value = "5", value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: u32,

    /// Logging level
    #[arg(long, global = true, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    pub log_level: String,

    /// Log file path
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Clear saved configuration
    #[arg(long, global = true)]
    pub clear: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Pipeline stage to run.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reduce raw flow files to per-group summary files
    Summarize {
        /// Raw files or directories (default: <data-dir>/incoming)
        inputs: Vec<PathBuf>,
        /// Column holding the summed metric (default: flow duration)
        #[arg(long)]
        metric_column: Option<usize>,
    },
    /// Merge summary files into the consolidated snapshot
    Consolidate {
        /// Summary files or directories (default: <data-dir>/summaries)
        summaries: Vec<PathBuf>,
    },
    /// Summarize then consolidate in one run
    Ingest {
        /// Raw files or directories (default: <data-dir>/incoming)
        inputs: Vec<PathBuf>,
        /// Column holding the summed metric (default: flow duration)
        #[arg(long)]
        metric_column: Option<usize>,
    },
    /// Export the consolidated rows of one (source, destination) pair
    Export {
        #[arg(long)]
        src: String,
        #[arg(long)]
        dst: String,
        /// Output file (default: <data-dir>/exports/<src>__<dst>.csv)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the latest consolidated snapshot as delimited text
    Show,
}

// ── LastUsedParams ─────────────────────────────────────────────────────────────

/// Persisted last-used parameters saved to `~/.flowstat/last_used.json`.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct LastUsedParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl LastUsedParams {
    /// Return the default path to the persisted config file.
    /// Uses `~/.flowstat/last_used.json`.
    pub fn config_path() -> PathBuf {
        Self::config_path_in(&dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
    }

    /// Return the config path rooted at `base_dir` (used for testing).
    pub fn config_path_in(base_dir: &Path) -> PathBuf {
        base_dir.join(".flowstat").join("last_used.json")
    }

    /// Load persisted params from an explicit path.
    /// Returns `Default` when the file is absent or cannot be parsed.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    /// Atomically write params to an explicit path.
    pub fn save_to(&self, path: &Path) -> std::result::Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;

        // Write to a temp file then rename for atomicity.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    /// Delete the config file at an explicit path if it exists.
    pub fn clear_at(path: &Path) -> std::result::Result<(), std::io::Error> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Parse CLI arguments, merge with last-used params where no explicit CLI
    /// value was provided, resolve `"auto"` values, and persist the result.
    pub fn load_with_last_used() -> Self {
        Self::load_with_last_used_impl(
            std::env::args_os().collect(),
            &LastUsedParams::config_path(),
        )
    }

    /// Full implementation – accepts args and an explicit config path so that
    /// tests can redirect to a temporary directory.
    pub fn load_with_last_used_impl(args: Vec<std::ffi::OsString>, config_path: &Path) -> Self {
        let matches = Settings::command().get_matches_from(args.clone());
        let mut settings = Settings::parse_from(args);

        if settings.clear {
            let _ = LastUsedParams::clear_at(config_path);
            return Self::resolve_auto_values(settings);
        }

        let last = LastUsedParams::load_from(config_path);

        // CLI and environment always win over persisted values.
        if settings.data_dir.is_none() {
            settings.data_dir = last.data_dir;
        }
        if settings.tag.is_none() {
            settings.tag = last.tag;
        }
        if !is_arg_explicitly_set(&matches, "timezone") {
            if let Some(v) = last.timezone {
                settings.timezone = v;
            }
        }

        settings = Self::resolve_auto_values(settings);

        let params = LastUsedParams::from(&settings);
        let _ = params.save_to(config_path);

        settings
    }

    /// Resolve `"auto"` sentinel values and apply the `--debug` flag.
    fn resolve_auto_values(mut settings: Settings) -> Settings {
        if settings.timezone == "auto" {
            settings.timezone = crate::time_utils::get_system_timezone();
        }
        if !crate::time_utils::validate_timezone(&settings.timezone) {
            tracing::warn!("Unknown timezone \"{}\", using UTC", settings.timezone);
            settings.timezone = "UTC".to_string();
        }
        if settings.debug {
            settings.log_level = "DEBUG".to_string();
        }
        settings
    }

    /// The configured data directory, or `MissingConfiguration`.
    pub fn require_data_dir(&self) -> Result<&Path> {
        self.data_dir.as_deref().ok_or_else(|| {
            FlowError::MissingConfiguration(
                "data directory not provided; pass --data-dir or set FLOWSTAT_DATA_DIR"
                    .to_string(),
            )
        })
    }

    /// The snapshot tag, validated against `[A-Za-z0-9._-]+`.
    pub fn snapshot_tag(&self) -> Result<&str> {
        let tag = self.tag.as_deref().unwrap_or(DEFAULT_TAG);
        validate_tag(tag)?;
        Ok(tag)
    }
}

/// Reject tags that are empty or could escape the snapshot directory.
pub fn validate_tag(tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag != "."
        && tag != ".."
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(FlowError::MissingConfiguration(format!(
            "invalid snapshot tag \"{}\"",
            tag
        )))
    }
}

// ── Conversion ─────────────────────────────────────────────────────────────────

impl From<&Settings> for LastUsedParams {
    fn from(s: &Settings) -> Self {
        LastUsedParams {
            data_dir: s.data_dir.clone(),
            tag: s.tag.clone(),
            timezone: Some(s.timezone.clone()),
        }
    }
}

/// Returns `true` when `name` was supplied explicitly on the command line
/// (not via default value or environment variable).
fn is_arg_explicitly_set(matches: &clap::ArgMatches, name: &str) -> bool {
    matches.value_source(name) == Some(clap::parser::ValueSource::CommandLine)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
