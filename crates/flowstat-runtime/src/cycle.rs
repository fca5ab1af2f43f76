//! One consolidation cycle: load the latest snapshot, merge partial batches
//! into it, and publish the result with an optimistic version check.
//!
//! A lost race (`SaveOutcome::Conflict`) or a transient storage failure
//! restarts the whole load→merge→save sequence after a back-off, so no
//! concurrent update is ever overwritten. When the retry budget is spent the
//! cycle fails with [`FlowError::RetryExhausted`]; the prior "latest" is
//! untouched in every failure case.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowstat_core::error::{FlowError, Result};
use flowstat_core::state::{merge, MergeReport, PartialBatch};
use tracing::{debug, info, warn};

use crate::store::{SaveOutcome, SnapshotStore, SnapshotVersion};

/// Default number of attempts per cycle.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Upper bound on a single back-off sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

// ── RetryPolicy ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// Sleep before retry number `retry` (1-based): base, 2×base, 4×base, …
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

// ── CancelToken ───────────────────────────────────────────────────────────────

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── CycleReport ───────────────────────────────────────────────────────────────

/// What a successful cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub merge: MergeReport,
    /// The published version, or `None` when nothing new was merged.
    pub saved: Option<SnapshotVersion>,
    /// Name of the immutable copy written, if any.
    pub archive: Option<String>,
    /// Keys in the resulting state.
    pub entries: usize,
    pub attempts: u32,
}

enum Attempt {
    Done(CycleReport),
    Conflict {
        expected: SnapshotVersion,
        current: SnapshotVersion,
    },
}

// ── ConsolidationCycle ────────────────────────────────────────────────────────

/// Runs load→merge→save against a [`SnapshotStore`].
pub struct ConsolidationCycle<S: SnapshotStore + ?Sized> {
    store: Arc<S>,
    tag: Option<String>,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl<S: SnapshotStore + ?Sized> ConsolidationCycle<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            tag: None,
            policy: RetryPolicy::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Merge `batches` into the latest snapshot and publish it.
    ///
    /// Batches already recorded in the snapshot's ledger are skipped. If all
    /// of them are, nothing is saved and `saved` is `None`.
    pub fn run(&self, batches: &[PartialBatch]) -> Result<CycleReport> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let sleep = self.policy.backoff(attempt - 1);
                debug!(attempt, sleep_ms = sleep.as_millis() as u64, "retrying cycle after back-off");
                thread::sleep(sleep);
            }
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }

            match self.attempt(batches) {
                Ok(Attempt::Done(mut report)) => {
                    report.attempts = attempt;
                    return Ok(report);
                }
                Ok(Attempt::Conflict { expected, current }) => {
                    let err = FlowError::VersionConflict {
                        expected: expected.get(),
                        current: current.get(),
                    };
                    warn!(attempt, error = %err, "lost snapshot race");
                    last = err.to_string();
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "cycle attempt failed");
                    last = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(FlowError::RetryExhausted {
            attempts: max_attempts,
            last,
        })
    }

    fn attempt(&self, batches: &[PartialBatch]) -> Result<Attempt> {
        let tag = self.tag.as_deref();
        let loaded = self.store.load(tag)?;
        let expected = loaded.version;

        let (state, merge_report) = merge(loaded.state, batches);
        if !merge_report.changed() {
            info!(
                duplicates = merge_report.duplicates.len(),
                "nothing new to merge; snapshot {} left as is", expected
            );
            return Ok(Attempt::Done(CycleReport {
                entries: state.len(),
                merge: merge_report,
                saved: None,
                archive: None,
                attempts: 0,
            }));
        }

        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        match self.store.save(&state, expected, tag)? {
            SaveOutcome::Saved { version, archive } => {
                info!(
                    applied = merge_report.applied.len(),
                    duplicates = merge_report.duplicates.len(),
                    new_keys = merge_report.new_keys,
                    "published snapshot {}", version
                );
                Ok(Attempt::Done(CycleReport {
                    entries: state.len(),
                    merge: merge_report,
                    saved: Some(version),
                    archive: Some(archive),
                    attempts: 0,
                }))
            }
            SaveOutcome::Conflict { current } => Ok(Attempt::Conflict { expected, current }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
