//! Core domain layer for flowstat.
//!
//! Group keys, the accumulator algebra, the merge engine with its
//! idempotency ledger, date resolution, configuration and the error type
//! shared by every other crate in the workspace.

pub mod accumulator;
pub mod error;
pub mod key;
pub mod settings;
pub mod state;
pub mod time_utils;

pub use accumulator::Accumulator;
pub use error::{FlowError, Result};
pub use key::GroupKey;
pub use state::{merge, BatchId, ConsolidatedState, MergeReport, PartialBatch};
