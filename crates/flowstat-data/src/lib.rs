//! Data layer for flowstat.
//!
//! Delimited text handling, record extraction into partial batches, the
//! summary-file and snapshot formats, filtered export and input discovery.

pub mod delimited;
pub mod export;
pub mod extractor;
pub mod reader;
pub mod snapshot;
pub mod summary;

pub use flowstat_core as core;
