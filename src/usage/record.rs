use std::path::Path;

use serde::Serialize;

use crate::error::{BatchError, Result};

/// One sample of a profiling log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsageRecord {
    pub elapsed_seconds: f64,
    /// Instantaneous utilisation; one fully busy core is 100.
    pub cpu_percent: f64,
    pub real_memory_mb: f64,
    pub virtual_memory_mb: f64,
}

impl ResourceUsageRecord {
    pub fn new(
        elapsed_seconds: f64,
        cpu_percent: f64,
        real_memory_mb: f64,
        virtual_memory_mb: f64,
    ) -> Self {
        Self {
            elapsed_seconds,
            cpu_percent,
            real_memory_mb,
            virtual_memory_mb,
        }
    }
}

/// Encoding of a profiling log, chosen from its first non-empty line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Comma-separated with a named header row.
    Csv,
    /// Whitespace-aligned columns under one or more header lines.
    Columnar,
}

impl LogFormat {
    pub fn sniff(text: &str) -> Option<Self> {
        let first = text.lines().map(str::trim).find(|l| !l.is_empty())?;
        if first.contains(',') {
            Some(LogFormat::Csv)
        } else {
            Some(LogFormat::Columnar)
        }
    }
}

const CSV_COLUMNS: [&str; 4] = ["elapsed_time", "cpu", "real_memory", "virtual_memory"];

/// Read and parse a profiling log file.
pub fn read_log(path: &Path) -> Result<Vec<ResourceUsageRecord>> {
    let text = std::fs::read_to_string(path)?;
    parse_log(&path.display().to_string(), &text)
}

/// Parse a profiling log in either supported encoding. A log with no data
/// rows parses to an empty vector; summarizing it is the error.
pub fn parse_log(source_name: &str, text: &str) -> Result<Vec<ResourceUsageRecord>> {
    let rows = match LogFormat::sniff(text) {
        None => return Ok(Vec::new()),
        Some(LogFormat::Csv) => parse_csv(source_name, text)?,
        Some(LogFormat::Columnar) => parse_columnar(source_name, text)?,
    };
    check_monotonic(source_name, &rows)?;
    Ok(rows.into_iter().map(|(_, record)| record).collect())
}

fn malformed(source_name: &str, line: usize, reason: impl Into<String>) -> BatchError {
    BatchError::MalformedLog {
        source_name: source_name.to_string(),
        line,
        reason: reason.into(),
    }
}

fn parse_number(source_name: &str, line: usize, column: &str, cell: &str) -> Result<f64> {
    let value: f64 = cell
        .trim()
        .parse()
        .map_err(|_| malformed(source_name, line, format!("{column}: not a number: {cell:?}")))?;
    if !value.is_finite() {
        return Err(malformed(source_name, line, format!("{column}: not finite")));
    }
    Ok(value)
}

/// Records paired with the 1-based file line they were read from.
type Rows = Vec<(usize, ResourceUsageRecord)>;

fn parse_csv(source_name: &str, text: &str) -> Result<Rows> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    let Some((header_line, header)) = lines.next() else {
        return Ok(Vec::new());
    };
    let names: Vec<String> = header
        .split(',')
        .map(|h| h.trim().trim_matches('"').to_ascii_lowercase())
        .collect();
    let mut index = [0usize; 4];
    for (slot, column) in index.iter_mut().zip(CSV_COLUMNS) {
        *slot = names.iter().position(|n| n == column).ok_or_else(|| {
            malformed(source_name, header_line, format!("missing column {column}"))
        })?;
    }

    let mut records = Vec::new();
    for (line_no, line) in lines {
        let cells: Vec<&str> = line.split(',').collect();
        let mut values = [0f64; 4];
        for ((value, &col), name) in values.iter_mut().zip(index.iter()).zip(CSV_COLUMNS) {
            let cell = cells.get(col).ok_or_else(|| {
                malformed(source_name, line_no, format!("missing value for {name}"))
            })?;
            *value = parse_number(source_name, line_no, name, cell)?;
        }
        records.push((
            line_no,
            ResourceUsageRecord::new(values[0], values[1], values[2], values[3]),
        ));
    }
    Ok(records)
}

fn parse_columnar(source_name: &str, text: &str) -> Result<Rows> {
    let mut records = Vec::new();
    let mut in_header = true;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if in_header {
            let is_header = line.starts_with('#') || tokens[0].parse::<f64>().is_err();
            if is_header {
                continue;
            }
            in_header = false;
        }
        if tokens.len() < 4 {
            return Err(malformed(
                source_name,
                line_no,
                format!("expected 4 columns, found {}", tokens.len()),
            ));
        }
        records.push((
            line_no,
            ResourceUsageRecord::new(
                parse_number(source_name, line_no, CSV_COLUMNS[0], tokens[0])?,
                parse_number(source_name, line_no, CSV_COLUMNS[1], tokens[1])?,
                parse_number(source_name, line_no, CSV_COLUMNS[2], tokens[2])?,
                parse_number(source_name, line_no, CSV_COLUMNS[3], tokens[3])?,
            ),
        ));
    }
    Ok(records)
}

fn check_monotonic(source_name: &str, rows: &[(usize, ResourceUsageRecord)]) -> Result<()> {
    for pair in rows.windows(2) {
        let (_, previous) = &pair[0];
        let (line_no, current) = &pair[1];
        if current.elapsed_seconds < previous.elapsed_seconds {
            return Err(malformed(
                source_name,
                *line_no,
                format!(
                    "elapsed time went backwards ({} after {})",
                    current.elapsed_seconds, previous.elapsed_seconds
                ),
            ));
        }
    }
    Ok(())
}
