//! Runtime layer for flowstat.
//!
//! Snapshot stores with optimistic versioning, the retrying consolidation
//! cycle, and parallel summarisation of raw input files.

pub mod cycle;
pub mod store;
pub mod summarizer;

pub use flowstat_core as core;
pub use flowstat_data as data;
