//! Resource usage accounting from per-job profiling logs.
//!
//! Each job's container runs under a profiler that samples elapsed time,
//! CPU utilisation and memory. This module parses those logs (CSV or
//! fixed-width columns), derives a [`UsageSummary`] per job and totals
//! CPU-hours across a batch. It works offline on retrieved logs and is not
//! coupled to a live run.

pub mod record;
pub mod summary;

pub use record::{parse_log, read_log, LogFormat, ResourceUsageRecord};
pub use summary::{
    aggregate_directory, aggregate_log_dir, load_log_dir, summarize, UsageReport, UsageSummary,
};
