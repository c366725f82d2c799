use thiserror::Error;

use crate::scheduler::JobOutcome;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Job submission rejected (HTTP {status}): {body}")]
    Submission { status: u16, body: String },

    #[error("Transient query error: {0}")]
    TransientQuery(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Job failed in session {}", .0.session_id)]
    JobFailed(Box<JobOutcome>),

    #[error("Job cancelled (session {session_id:?})")]
    Cancelled { session_id: Option<String> },

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Resource usage log is empty: {0}")]
    EmptyLog(String),

    #[error("No resource usage logs found: {0}")]
    NoLogs(String),

    #[error("Malformed resource usage log {source_name} (line {line}): {reason}")]
    MalformedLog {
        source_name: String,
        line: usize,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    /// Status and log queries that fail this way are retried at the poll interval.
    pub fn is_transient(&self) -> bool {
        matches!(self, BatchError::TransientQuery(_))
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
