//! The per-file pipeline engine
//!
//! Stages compose behind two small contracts: a producing side
//! ([`read::RecordSource`]: open, next_batch, close) and a consuming side
//! ([`write::BatchSink`]: push_batch, flush). The [`runner::PipelineRunner`]
//! owns stage lifetimes and drives one batch at a time through
//! read → validate → write, then audit, publish and cleanup.

pub mod audit;
pub mod batch;
pub mod publish;
pub mod read;
pub mod retry;
pub mod runner;
pub mod validate;
pub mod write;

/// Row accounting for one file load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub read: u64,
    pub valid: u64,
    pub invalid: u64,
    pub published: u64,
}
