//! FileLoader: streaming ingestion of structured data files into relational
//! and analytic targets.
//!
//! Each discovered file is matched to a declared source configuration and run
//! through a staged, bounded-memory pipeline: archive → dedup → stage →
//! read → validate → write → audit → publish → cleanup. Files are processed
//! in parallel by a bounded worker pool; stages within one file run strictly
//! sequentially with single-batch hand-off.
//!
//! | Module     | Responsibility |
//! |------------|----------------|
//! | `config`   | Environment-driven settings |
//! | `sources`  | Source configurations and the process registry |
//! | `store`    | FileStore capability (local, S3) |
//! | `db`       | DbAdapter capability, SQL dialects, Postgres + memory adapters |
//! | `pipeline` | Per-file engine: readers, validator, writer, auditor, publisher, runner |
//! | `dispatch` | Drop-directory discovery and the worker pool |
//! | `notify`   | Stakeholder email construction, webhook client |

pub mod cli;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod notify;
pub mod pipeline;
pub mod sources;
pub mod store;

pub use fileloader_common::{Audience, ErrorKind, LoadError, LoadResult};
