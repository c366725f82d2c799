//! Directory-level resource usage aggregation over real files.

use std::path::Path;

use skaha_batch::error::BatchError;
use skaha_batch::usage::{aggregate_log_dir, load_log_dir, read_log, summarize};
use tempfile::TempDir;

const CSV_LOG: &str = "elapsed_time,cpu,real_memory,virtual_memory\n\
                       0.0,10.0,100.0,150.0\n\
                       1.0,50.0,120.0,180.0\n\
                       2.0,30.0,115.0,170.0\n";

/// psrecord's plain-text layout: two comment header lines, aligned columns.
const COLUMNAR_LOG: &str = "\
# Elapsed time   CPU (%)     Real (MB)   Virtual (MB)
#   (seconds)
       0.000       100.000      200.000      400.000
    3600.000       100.000      250.000      410.000
";

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

#[test]
fn test_read_log_and_summarize_reference_values() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "sofia_01_profile.csv", CSV_LOG);

    let records = read_log(&dir.path().join("sofia_01_profile.csv")).unwrap();
    let summary = summarize(&records, 8).unwrap();

    assert_eq!(summary.runtime_seconds, 2.0);
    assert!((summary.avg_cpu_percent - 30.0).abs() < 1e-9);
    assert_eq!(summary.peak_memory_mb, 120.0);
    assert_eq!(summary.peak_virtual_memory_mb, 180.0);
    assert!((summary.cpu_hours - 0.0013333).abs() < 1e-6);
}

#[test]
fn test_aggregate_mixed_encodings_and_bad_logs() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.csv", CSV_LOG);
    write(dir.path(), "b.txt", COLUMNAR_LOG);
    write(
        dir.path(),
        "broken.csv",
        "elapsed_time,cpu,real_memory,virtual_memory\n0,abc,1,1\n",
    );
    write(dir.path(), "empty.log", "");
    write(dir.path(), "README.md", "not a log");

    let report = aggregate_log_dir(dir.path(), 8).unwrap();

    assert_eq!(report.summaries.len(), 4);
    assert_eq!(report.summarized(), 2);
    assert!(!report.summaries.contains_key("README"));
    assert!(matches!(
        report.summaries["broken"],
        Err(BatchError::MalformedLog { line: 2, .. })
    ));
    assert!(matches!(
        report.summaries["empty"],
        Err(BatchError::EmptyLog(_))
    ));

    let a = report.summaries["a"].as_ref().unwrap().cpu_hours;
    let b = report.summaries["b"].as_ref().unwrap();
    // 100% CPU for an hour on eight cores.
    assert!((b.cpu_hours - 8.0).abs() < 1e-9);
    assert_eq!(b.peak_memory_mb, 250.0);
    assert!((report.total_cpu_hours - (a + b.cpu_hours)).abs() < 1e-9);
    assert_eq!(report.errors().count(), 2);
}

#[test]
fn test_missing_directory_is_no_logs() {
    let dir = TempDir::new().unwrap();
    let err = aggregate_log_dir(&dir.path().join("nope"), 8).unwrap_err();
    assert!(matches!(err, BatchError::NoLogs(_)));
}

#[test]
fn test_directory_without_logs_is_no_logs() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "notes.md", "nothing here");
    std::fs::create_dir(dir.path().join("nested.csv")).unwrap();

    assert!(matches!(load_log_dir(dir.path()), Err(BatchError::NoLogs(_))));
}
