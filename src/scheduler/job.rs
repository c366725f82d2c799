use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// Lifecycle state of a headless session as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Terminating,
    Succeeded,
    Failed,
    /// Any token the backend reports that is not in the recognized set.
    Unknown,
}

impl JobStatus {
    /// Classify a raw backend status token. Matching is exact; anything
    /// unrecognized is `Unknown`, which keeps the job polling.
    pub fn classify(token: &str) -> Self {
        match token.trim() {
            "Pending" => JobStatus::Pending,
            "Running" => JobStatus::Running,
            "Terminating" => JobStatus::Terminating,
            "Succeeded" => JobStatus::Succeeded,
            "Failed" => JobStatus::Failed,
            _ => JobStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Terminating => write!(f, "terminating"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Opaque session identifier issued by the backend for one submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of one headless container job.
///
/// Built once per subregion through [`JobSpec::builder`]. There are no setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    name: String,
    container_image: String,
    cores: u32,
    ram_gib: u32,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn builder(name: impl Into<String>) -> JobSpecBuilder {
        JobSpecBuilder {
            name: name.into(),
            container_image: String::new(),
            cores: 1,
            ram_gib: 1,
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container_image(&self) -> &str {
        &self.container_image
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn ram_gib(&self) -> u32 {
        self.ram_gib
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Turn a free-form run id (usually a parameter file stem) into a
    /// session name the backend accepts.
    pub fn sanitize_name(run_id: &str) -> String {
        let replaced: String = run_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        replaced.trim_matches('-').to_string()
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(BatchError::InvalidSpec("job name is empty".to_string()));
        }
        if let Some(bad) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
            return Err(BatchError::InvalidSpec(format!(
                "job name {name:?} contains reserved character {bad:?}"
            )));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(BatchError::InvalidSpec(format!(
                "job name {name:?} must not start or end with '-'"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JobSpecBuilder {
    name: String,
    container_image: String,
    cores: u32,
    ram_gib: u32,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl JobSpecBuilder {
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.container_image = image.into();
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    pub fn ram_gib(mut self, ram_gib: u32) -> Self {
        self.ram_gib = ram_gib;
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<JobSpec> {
        JobSpec::validate_name(&self.name)?;
        if self.container_image.trim().is_empty() {
            return Err(BatchError::InvalidSpec(format!(
                "job {} has no container image",
                self.name
            )));
        }
        if self.cores == 0 {
            return Err(BatchError::InvalidSpec(format!(
                "job {} must request at least one core",
                self.name
            )));
        }
        if self.ram_gib == 0 {
            return Err(BatchError::InvalidSpec(format!(
                "job {} must request at least 1 GiB of RAM",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(BatchError::InvalidSpec(format!(
                "job {} has no command",
                self.name
            )));
        }
        Ok(JobSpec {
            name: self.name,
            container_image: self.container_image,
            cores: self.cores,
            ram_gib: self.ram_gib,
            command: self.command,
            args: self.args,
            env: self.env,
        })
    }
}

/// Result of driving one job to a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub session_id: String,
    /// Always `Succeeded` or `Failed`.
    pub status: JobStatus,
    pub log_text: String,
    /// Set for failures; holds the container log text for postmortem.
    pub diagnostic: Option<String>,
    pub polls: u32,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> JobSpecBuilder {
        JobSpec::builder(name)
            .image("images.canfar.net/srcnet/sofia-task:latest")
            .command("/bin/bash")
    }

    #[test]
    fn classify_recognized_tokens() {
        assert_eq!(JobStatus::classify("Pending"), JobStatus::Pending);
        assert_eq!(JobStatus::classify("Running"), JobStatus::Running);
        assert_eq!(JobStatus::classify("Terminating"), JobStatus::Terminating);
        assert_eq!(JobStatus::classify("Succeeded"), JobStatus::Succeeded);
        assert_eq!(JobStatus::classify("Failed"), JobStatus::Failed);
    }

    #[test]
    fn classify_unrecognized_is_unknown_and_not_terminal() {
        for token in ["Paused", "succeeded", "FAILED", "", "Completed"] {
            let status = JobStatus::classify(token);
            assert_eq!(status, JobStatus::Unknown, "token {token:?}");
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Terminating.is_terminal());
    }

    #[test]
    fn builder_produces_spec() {
        let s = spec("sofia-1")
            .cores(8)
            .ram_gib(32)
            .arg("arc:projects/x/sofia_1_cmd.sh")
            .env("OMP_NUM_THREADS", "8")
            .build()
            .unwrap();
        assert_eq!(s.name(), "sofia-1");
        assert_eq!(s.cores(), 8);
        assert_eq!(s.ram_gib(), 32);
        assert_eq!(s.args(), ["arc:projects/x/sofia_1_cmd.sh".to_string()]);
        assert_eq!(s.env().get("OMP_NUM_THREADS").map(String::as_str), Some("8"));
    }

    #[test]
    fn builder_rejects_reserved_characters() {
        assert!(matches!(
            spec("sofia_1").build(),
            Err(BatchError::InvalidSpec(_))
        ));
        assert!(matches!(
            spec("sofia 1").build(),
            Err(BatchError::InvalidSpec(_))
        ));
        assert!(matches!(spec("").build(), Err(BatchError::InvalidSpec(_))));
        assert!(matches!(spec("-x").build(), Err(BatchError::InvalidSpec(_))));
    }

    #[test]
    fn builder_rejects_zero_resources() {
        assert!(spec("a").cores(0).build().is_err());
        assert!(spec("a").ram_gib(0).build().is_err());
        assert!(JobSpec::builder("a").command("x").build().is_err());
    }

    #[test]
    fn sanitize_name_replaces_underscores() {
        assert_eq!(JobSpec::sanitize_name("sofia_sub_03"), "sofia-sub-03");
        assert_eq!(JobSpec::sanitize_name("_edge_"), "edge");
    }
}
