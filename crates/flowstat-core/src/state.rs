//! Partial batches, the consolidated state, and the merge engine that folds
//! the former into the latter.
//!
//! Merging is a pure function of `(prior state, batches)`. Each batch carries
//! a [`BatchId`]; the consolidated state remembers every id it has absorbed,
//! so a batch delivered twice (at-least-once transport, a re-run of the
//! consolidator over the same summary files) contributes exactly once.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, warn};

use crate::accumulator::Accumulator;
use crate::error::{FlowError, Result};
use crate::key::GroupKey;

// ── BatchId ───────────────────────────────────────────────────────────────────

/// Stable identifier of one input unit (typically its summary file name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── PartialBatch ──────────────────────────────────────────────────────────────

/// Per-key totals of one input unit, ready to be merged.
///
/// Each key holds a single value; adding to an existing key sums into it.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialBatch {
    id: BatchId,
    totals: BTreeMap<GroupKey, f64>,
}

impl PartialBatch {
    pub fn new(id: impl Into<BatchId>) -> Self {
        Self {
            id: id.into(),
            totals: BTreeMap::new(),
        }
    }

    pub fn from_totals(id: impl Into<BatchId>, totals: BTreeMap<GroupKey, f64>) -> Self {
        Self {
            id: id.into(),
            totals,
        }
    }

    /// Sum `value` into the entry for `key`.
    pub fn add(&mut self, key: GroupKey, value: f64) {
        *self.totals.entry(key).or_insert(0.0) += value;
    }

    pub fn id(&self) -> &BatchId {
        &self.id
    }

    pub fn get(&self, key: &GroupKey) -> Option<f64> {
        self.totals.get(key).copied()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, f64)> {
        self.totals.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

// ── MergeReport ───────────────────────────────────────────────────────────────

/// What a call to [`merge`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Batches folded into the state, in application order.
    pub applied: Vec<BatchId>,
    /// Batches skipped because their id was already in the ledger.
    pub duplicates: Vec<BatchId>,
    /// Number of samples contributed across all applied batches.
    pub contributions: usize,
    /// Number of keys that did not exist before this merge.
    pub new_keys: usize,
}

impl MergeReport {
    /// `true` when at least one batch changed the state.
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

// ── ConsolidatedState ─────────────────────────────────────────────────────────

/// Lifetime aggregate of every merged batch, plus the ledger of merged ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidatedState {
    entries: BTreeMap<GroupKey, Accumulator>,
    applied: BTreeSet<BatchId>,
}

impl ConsolidatedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a state from persisted parts.
    pub fn from_parts(
        entries: BTreeMap<GroupKey, Accumulator>,
        applied: BTreeSet<BatchId>,
    ) -> Self {
        Self { entries, applied }
    }

    /// Exact key lookup.
    pub fn get(&self, key: &GroupKey) -> Option<&Accumulator> {
        self.entries.get(key)
    }

    /// Entries in [`GroupKey`] order.
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &Accumulator)> {
        self.entries.iter()
    }

    /// Ids of every batch merged into this state's lineage, sorted.
    pub fn applied_batches(&self) -> impl Iterator<Item = &BatchId> {
        self.applied.iter()
    }

    pub fn has_applied(&self, id: &BatchId) -> bool {
        self.applied.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fails with [`FlowError::OutOfRange`] naming the first entry whose sums
    /// overflowed. A state that passes survives a save and reload.
    pub fn ensure_finite(&self) -> Result<()> {
        match self.entries.iter().find(|(_, acc)| !acc.is_finite()) {
            Some((key, _)) => Err(FlowError::OutOfRange(key.to_string())),
            None => Ok(()),
        }
    }

    /// Fold one batch in, each entry as exactly one sample.
    ///
    /// Returns the number of contributions, or [`FlowError::DuplicateBatch`]
    /// (leaving the state untouched) when the id was already merged.
    pub fn apply(&mut self, batch: &PartialBatch) -> Result<usize> {
        self.apply_counting(batch)
            .map(|(contributions, _)| contributions)
            .ok_or_else(|| FlowError::DuplicateBatch(batch.id().clone()))
    }

    /// `None` when the batch id is already in the ledger.
    fn apply_counting(&mut self, batch: &PartialBatch) -> Option<(usize, usize)> {
        if !self.applied.insert(batch.id().clone()) {
            return None;
        }

        let mut new_keys = 0;
        for (key, value) in batch.iter() {
            match self.entries.entry(key.clone()) {
                Entry::Occupied(mut slot) => {
                    let acc = slot.get_mut();
                    *acc = acc.contribute(value);
                }
                Entry::Vacant(slot) => {
                    slot.insert(Accumulator::sample(value));
                    new_keys += 1;
                }
            }
        }
        Some((batch.len(), new_keys))
    }
}

// ── Merge engine ──────────────────────────────────────────────────────────────

/// Merge `batches` into `prior`, returning the new state and a report.
///
/// The result does not depend on the order of `batches`. Batches whose id is
/// already in the ledger, including ids repeated within `batches`, are
/// skipped and listed in [`MergeReport::duplicates`].
pub fn merge<'a, I>(prior: ConsolidatedState, batches: I) -> (ConsolidatedState, MergeReport)
where
    I: IntoIterator<Item = &'a PartialBatch>,
{
    let mut state = prior;
    let mut report = MergeReport::default();

    for batch in batches {
        match state.apply_counting(batch) {
            Some((contributions, new_keys)) => {
                debug!(
                    batch = %batch.id(),
                    contributions,
                    new_keys,
                    "merged partial batch"
                );
                report.contributions += contributions;
                report.new_keys += new_keys;
                report.applied.push(batch.id().clone());
            }
            None => {
                warn!(batch = %batch.id(), "batch already merged; skipping");
                report.duplicates.push(batch.id().clone());
            }
        }
    }

    (state, report)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn key(src: &str, dst: &str, day: u32) -> GroupKey {
        GroupKey::new(src, dst, NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
    }

    fn batch(id: &str, rows: &[(&str, &str, u32, f64)]) -> PartialBatch {
        let mut b = PartialBatch::new(id);
        for (src, dst, day, value) in rows {
            b.add(key(src, dst, *day), *value);
        }
        b
    }

    fn states_close(a: &ConsolidatedState, b: &ConsolidatedState) -> bool {
        a.len() == b.len()
            && a.applied == b.applied
            && a.iter()
                .zip(b.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.approx_eq(vb, 1e-9))
    }

    #[test]
    fn test_partial_batch_sums_same_key() {
        let b = batch("unit-1", &[("A", "B", 1, 100.5), ("A", "B", 1, 50.0)]);
        assert_eq!(b.len(), 1);
        assert_eq!(b.get(&key("A", "B", 1)), Some(150.5));
    }

    #[test]
    fn test_merge_into_empty_state() {
        let first = batch("f1", &[("A", "B", 1, 150.5)]);
        let second = batch("f2", &[("A", "B", 1, 80.0)]);

        let (state, report) = merge(ConsolidatedState::new(), [&first, &second]);

        let acc = state.get(&key("A", "B", 1)).unwrap();
        assert_eq!(acc.count(), 2);
        assert!((acc.sum() - 230.5).abs() < 1e-9);
        assert!((acc.mean() - 115.25).abs() < 1e-9);
        assert!((acc.stddev() - 35.25).abs() < 1e-6);

        assert_eq!(report.applied, vec![BatchId::new("f1"), BatchId::new("f2")]);
        assert!(report.duplicates.is_empty());
        assert_eq!(report.contributions, 2);
        assert_eq!(report.new_keys, 1);
    }

    #[test]
    fn test_each_entry_contributes_exactly_one_sample() {
        let b = batch(
            "f1",
            &[("A", "B", 1, 1.0), ("A", "C", 1, 2.0), ("A", "B", 2, 3.0)],
        );
        let (state, report) = merge(ConsolidatedState::new(), [&b]);

        assert_eq!(report.contributions, 3);
        for (_, acc) in state.iter() {
            assert_eq!(acc.count(), 1);
        }
    }

    #[test]
    fn test_remerge_same_batch_is_noop() {
        let b = batch("day1_summary.csv", &[("A", "B", 1, 10.0)]);
        let (once, _) = merge(ConsolidatedState::new(), [&b]);
        let (twice, report) = merge(once.clone(), [&b]);

        assert_eq!(once, twice);
        assert!(report.applied.is_empty());
        assert_eq!(report.duplicates, vec![BatchId::new("day1_summary.csv")]);
        assert!(!report.changed());
    }

    #[test]
    fn test_duplicate_within_one_call_is_skipped() {
        let b = batch("f1", &[("A", "B", 1, 10.0)]);
        let (state, report) = merge(ConsolidatedState::new(), [&b, &b]);

        assert_eq!(state.get(&key("A", "B", 1)).unwrap().count(), 1);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.duplicates.len(), 1);
    }

    #[test]
    fn test_apply_reports_duplicate_error() {
        let b = batch("f1", &[("A", "B", 1, 10.0)]);
        let mut state = ConsolidatedState::new();
        assert_eq!(state.apply(&b).unwrap(), 1);

        let before = state.clone();
        let err = state.apply(&b).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateBatch(ref id) if id.as_str() == "f1"));
        assert_eq!(state, before);
    }

    #[test]
    fn test_merge_order_independence() {
        let b1 = batch("b1", &[("A", "B", 1, 1.5), ("X", "Y", 2, 4.0)]);
        let b2 = batch("b2", &[("A", "B", 1, 2.5)]);
        let b3 = batch("b3", &[("A", "B", 1, -7.0), ("C", "D", 3, 9.0)]);

        let (s, _) = merge(ConsolidatedState::new(), [&b1, &b2]);
        let (left, _) = merge(s, [&b3]);

        let (s, _) = merge(ConsolidatedState::new(), [&b3, &b2]);
        let (right, _) = merge(s, [&b1]);

        assert!(states_close(&left, &right));
    }

    #[test]
    fn test_ensure_finite_names_overflowing_entry() {
        let fine = batch("b1", &[("A", "B", 1, 1e150)]);
        let (state, _) = merge(ConsolidatedState::new(), [&fine]);
        assert!(state.ensure_finite().is_ok());

        let huge = batch("b2", &[("C", "D", 2, 1e200)]);
        let (state, _) = merge(state, [&huge]);
        let err = state.ensure_finite().unwrap_err();
        assert!(matches!(&err, FlowError::OutOfRange(k) if k == "C→D@2024-01-02"));
    }

    #[test]
    fn test_empty_batch_is_recorded_in_ledger() {
        let empty = PartialBatch::new("empty-unit");
        let (state, report) = merge(ConsolidatedState::new(), [&empty]);
        assert!(state.is_empty());
        assert!(state.has_applied(&BatchId::new("empty-unit")));
        assert_eq!(report.contributions, 0);
        assert!(report.changed());
    }

    fn arb_batches() -> impl Strategy<Value = Vec<PartialBatch>> {
        let row = (0u8..3, 0u8..3, 1u32..4, -1.0e3f64..1.0e3);
        proptest::collection::vec(proptest::collection::vec(row, 0..6), 1..6).prop_map(
            |units| {
                units
                    .into_iter()
                    .enumerate()
                    .map(|(i, rows)| {
                        let mut b = PartialBatch::new(format!("unit-{i}"));
                        for (s, d, day, v) in rows {
                            b.add(key(&format!("s{s}"), &format!("d{d}"), day), v);
                        }
                        b
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(batches in arb_batches()) {
            let (forward, _) = merge(ConsolidatedState::new(), batches.iter());
            let (backward, _) = merge(ConsolidatedState::new(), batches.iter().rev());
            prop_assert!(states_close(&forward, &backward));
        }

        #[test]
        fn prop_redelivery_leaves_state_unchanged(batches in arb_batches()) {
            let (state, _) = merge(ConsolidatedState::new(), batches.iter());
            let (again, report) = merge(state.clone(), batches.iter());
            prop_assert_eq!(again, state);
            prop_assert_eq!(report.duplicates.len(), batches.len());
        }
    }
}
