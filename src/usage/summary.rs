use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::error::{BatchError, Result};
use crate::usage::record::{read_log, ResourceUsageRecord};

/// File extensions treated as profiling logs when scanning a directory.
pub const LOG_EXTENSIONS: [&str; 3] = ["csv", "txt", "log"];

/// Derived per-job resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageSummary {
    pub runtime_seconds: f64,
    pub avg_cpu_percent: f64,
    pub peak_memory_mb: f64,
    pub peak_virtual_memory_mb: f64,
    pub cpu_hours: f64,
    pub samples: usize,
}

impl fmt::Display for UsageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "runtime {:.2}s, avg CPU {:.2}%, peak mem {:.1} MB, peak virtual {:.1} MB, CPU-hours {:.4}",
            self.runtime_seconds,
            self.avg_cpu_percent,
            self.peak_memory_mb,
            self.peak_virtual_memory_mb,
            self.cpu_hours
        )
    }
}

/// Summarize one job's samples.
///
/// `cpu_hours = avg_cpu_percent / 100 * core_count * runtime_seconds / 3600`.
/// An empty sequence is [`BatchError::EmptyLog`], never a zeroed summary.
pub fn summarize(records: &[ResourceUsageRecord], core_count: u32) -> Result<UsageSummary> {
    if records.is_empty() {
        return Err(BatchError::EmptyLog("log has no samples".to_string()));
    }
    if core_count == 0 {
        return Err(BatchError::Config("core count must be positive".to_string()));
    }

    let samples = records.len();
    let runtime_seconds = records
        .iter()
        .map(|r| r.elapsed_seconds)
        .fold(f64::MIN, f64::max);
    let avg_cpu_percent = records.iter().map(|r| r.cpu_percent).sum::<f64>() / samples as f64;
    let peak_memory_mb = records
        .iter()
        .map(|r| r.real_memory_mb)
        .fold(f64::MIN, f64::max);
    let peak_virtual_memory_mb = records
        .iter()
        .map(|r| r.virtual_memory_mb)
        .fold(f64::MIN, f64::max);
    let cpu_hours = avg_cpu_percent / 100.0 * f64::from(core_count) * runtime_seconds / 3600.0;

    Ok(UsageSummary {
        runtime_seconds,
        avg_cpu_percent,
        peak_memory_mb,
        peak_virtual_memory_mb,
        cpu_hours,
        samples,
    })
}

/// Per-job summaries plus the CPU-hours of every job that summarized.
#[derive(Debug)]
pub struct UsageReport {
    pub summaries: BTreeMap<String, Result<UsageSummary>>,
    pub total_cpu_hours: f64,
}

impl UsageReport {
    pub fn summarized(&self) -> usize {
        self.summaries.values().filter(|s| s.is_ok()).count()
    }

    pub fn errors(&self) -> impl Iterator<Item = (&String, &BatchError)> {
        self.summaries
            .iter()
            .filter_map(|(name, s)| s.as_ref().err().map(|e| (name, e)))
    }
}

/// Summarize every job's samples and total their CPU-hours. A job whose log
/// is empty gets an error entry; the others are still summarized.
pub fn aggregate_directory(
    records: &BTreeMap<String, Vec<ResourceUsageRecord>>,
    core_count: u32,
) -> Result<UsageReport> {
    aggregate(
        records
            .iter()
            .map(|(name, recs)| (name.clone(), Ok(recs.as_slice()))),
        core_count,
    )
}

/// Load every log file in `dir` and aggregate them. Job names are file
/// stems; a file that fails to read or parse is an error entry for that job.
pub fn aggregate_log_dir(dir: &Path, core_count: u32) -> Result<UsageReport> {
    aggregate(load_log_dir(dir)?, core_count)
}

/// Parse every profiling log in a directory, keyed by file stem.
pub fn load_log_dir(dir: &Path) -> Result<BTreeMap<String, Result<Vec<ResourceUsageRecord>>>> {
    if !dir.is_dir() {
        return Err(BatchError::NoLogs(format!(
            "logs directory does not exist: {}",
            dir.display()
        )));
    }

    let mut logs = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_log = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| LOG_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if !is_log {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        tracing::debug!(job = name, path = %path.display(), "Reading profiling log");
        logs.insert(name.to_string(), read_log(&path));
    }

    if logs.is_empty() {
        return Err(BatchError::NoLogs(format!(
            "no log files in {}",
            dir.display()
        )));
    }
    Ok(logs)
}

fn aggregate<I, R>(logs: I, core_count: u32) -> Result<UsageReport>
where
    I: IntoIterator<Item = (String, Result<R>)>,
    R: AsRef<[ResourceUsageRecord]>,
{
    let mut summaries = BTreeMap::new();
    let mut total_cpu_hours = 0.0;

    for (name, parsed) in logs {
        let summary = parsed.and_then(|records| {
            summarize(records.as_ref(), core_count).map_err(|e| match e {
                BatchError::EmptyLog(_) => BatchError::EmptyLog(name.clone()),
                other => other,
            })
        });
        match &summary {
            Ok(s) => {
                total_cpu_hours += s.cpu_hours;
                tracing::info!(job = %name, runtime_seconds = s.runtime_seconds, avg_cpu_percent = s.avg_cpu_percent, cpu_hours = s.cpu_hours, "Summarized log");
            }
            Err(e) => tracing::error!(job = %name, error = %e, "Could not summarize log"),
        }
        summaries.insert(name, summary);
    }

    if summaries.is_empty() {
        return Err(BatchError::NoLogs("no logs to aggregate".to_string()));
    }
    Ok(UsageReport {
        summaries,
        total_cpu_hours,
    })
}
