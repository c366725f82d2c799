//! Test harness for controller, orchestrator and batch tests.
//!
//! Provides a scripted in-memory session backend that replays a fixed
//! status sequence per job and counts concurrently live sessions, plus a
//! recording remote storage fake.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use skaha_batch::backend::JobBackend;
use skaha_batch::config::{ControllerConfig, OrchestratorConfig};
use skaha_batch::error::{BatchError, Result};
use skaha_batch::scheduler::{JobSpec, JobStatus, SessionHandle};
use skaha_batch::storage::RemoteStorage;

pub const TEST_IMAGE: &str = "images.canfar.net/srcnet/sofia-task:latest";

/// Short poll interval so tests finish quickly.
pub fn fast_controller() -> ControllerConfig {
    ControllerConfig::default().with_poll_interval(Duration::from_millis(5))
}

pub fn fast_orchestrator(max_concurrency: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrency,
        controller: fast_controller(),
        ..OrchestratorConfig::default()
    }
}

pub fn spec(name: &str) -> JobSpec {
    JobSpec::builder(name)
        .image(TEST_IMAGE)
        .cores(8)
        .ram_gib(32)
        .command("/bin/bash")
        .arg(format!("/arc/projects/test/{name}_cmd.sh"))
        .build()
        .unwrap()
}

/// One answer to a status query.
#[derive(Debug, Clone)]
pub enum Step {
    Status(String),
    /// The query itself fails transiently (transport glitch, bad JSON).
    QueryError,
}

pub fn status(token: &str) -> Step {
    Step::Status(token.to_string())
}

/// How the backend treats one job, selected by job name.
#[derive(Debug, Clone)]
pub struct JobScript {
    /// Reject the create call with this HTTP status and body.
    pub reject: Option<(u16, String)>,
    /// Replayed in order; the last step repeats forever.
    pub steps: Vec<Step>,
    pub logs: String,
    /// Log fetches that fail before one succeeds; `usize::MAX` never succeeds.
    pub failing_log_fetches: usize,
    /// Log fetch failures are transient query errors unless this is set.
    pub log_failure_permanent: bool,
}

impl JobScript {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            reject: None,
            steps,
            logs: "sofia: pipeline finished".to_string(),
            failing_log_fetches: 0,
            log_failure_permanent: false,
        }
    }

    pub fn succeeds() -> Self {
        Self::new(vec![status("Pending"), status("Running"), status("Succeeded")])
    }

    pub fn fails(logs: &str) -> Self {
        Self::new(vec![status("Running"), status("Failed")]).with_logs(logs)
    }

    pub fn rejected(code: u16, body: &str) -> Self {
        Self {
            reject: Some((code, body.to_string())),
            ..Self::new(vec![status("Succeeded")])
        }
    }

    pub fn with_logs(mut self, logs: &str) -> Self {
        self.logs = logs.to_string();
        self
    }

    pub fn with_failing_log_fetches(mut self, failures: usize) -> Self {
        self.failing_log_fetches = failures;
        self
    }

    pub fn with_permanent_log_failure(mut self) -> Self {
        self.failing_log_fetches = usize::MAX;
        self.log_failure_permanent = true;
        self
    }
}

#[derive(Debug)]
struct Session {
    job: String,
    polls: usize,
    log_fetches: usize,
    live: bool,
}

/// In-memory [`JobBackend`] driven by per-job scripts.
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, JobScript>>,
    default_script: JobScript,
    sessions: Mutex<HashMap<String, Session>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    creates: AtomicUsize,
    status_calls: AtomicUsize,
    log_calls: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    images: Vec<String>,
}

impl ScriptedBackend {
    pub fn new(default_script: JobScript) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_script,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            peak_live: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
            images: vec![TEST_IMAGE.to_string()],
        }
    }

    pub fn with_script(self, job: &str, script: JobScript) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(job.to_string(), script);
        self
    }

    pub fn with_images(mut self, images: &[&str]) -> Self {
        self.images = images.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn script_for(&self, job: &str) -> JobScript {
        self.scripts
            .lock()
            .unwrap()
            .get(job)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    fn release(&self, session: &mut Session) {
        if session.live {
            session.live = false;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Number of create calls that reached the backend.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    /// Most sessions that were live (created, not yet terminal) at once.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobBackend for ScriptedBackend {
    async fn create(&self, spec: &JobSpec) -> Result<SessionHandle> {
        let script = self.script_for(spec.name());
        if let Some((status, body)) = script.reject {
            return Err(BatchError::Submission { status, body });
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("session-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(now, Ordering::SeqCst);
        self.sessions.lock().unwrap().insert(
            id.clone(),
            Session {
                job: spec.name().to_string(),
                polls: 0,
                log_fetches: 0,
                live: true,
            },
        );
        Ok(SessionHandle::new(id))
    }

    async fn status(&self, handle: &SessionHandle) -> Result<String> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(handle.id())
            .ok_or_else(|| BatchError::TransientQuery(format!("no session {handle}")))?;
        let script = self.script_for(&session.job);
        let step = script
            .steps
            .get(session.polls)
            .or_else(|| script.steps.last())
            .cloned()
            .unwrap_or_else(|| status("Pending"));
        session.polls += 1;

        match step {
            Step::QueryError => Err(BatchError::TransientQuery("connection reset".to_string())),
            Step::Status(token) => {
                if JobStatus::classify(&token).is_terminal() {
                    self.release(session);
                }
                Ok(token)
            }
        }
    }

    async fn logs(&self, handle: &SessionHandle) -> Result<String> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(handle.id())
            .ok_or_else(|| BatchError::TransientQuery(format!("no session {handle}")))?;
        let script = self.script_for(&session.job);
        session.log_fetches += 1;
        if session.log_fetches <= script.failing_log_fetches {
            if script.log_failure_permanent {
                return Err(BatchError::Internal("log view not supported".to_string()));
            }
            return Err(BatchError::TransientQuery("log endpoint timed out".to_string()));
        }
        Ok(script.logs)
    }

    async fn delete(&self, handle: &SessionHandle) -> Result<()> {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(handle.id()) {
            self.release(session);
        }
        self.deleted.lock().unwrap().push(handle.id().to_string());
        Ok(())
    }

    async fn images(&self, _kind: &str) -> Result<Vec<String>> {
        Ok(self.images.clone())
    }
}

/// [`RemoteStorage`] fake that records copies and answers `exists` from a set.
#[derive(Default)]
pub struct FakeStorage {
    existing: Mutex<HashSet<String>>,
    copies: Mutex<Vec<(String, String)>>,
    failing_sources: Mutex<HashSet<String>>,
}

impl FakeStorage {
    pub fn with_existing(paths: &[&str]) -> Self {
        let storage = Self::default();
        storage
            .existing
            .lock()
            .unwrap()
            .extend(paths.iter().map(|p| p.to_string()));
        storage
    }

    pub fn fail_copies_from(self, source: &str) -> Self {
        self.failing_sources
            .lock()
            .unwrap()
            .insert(source.to_string());
        self
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStorage for FakeStorage {
    async fn exists(&self, remote_path: &str) -> Result<bool> {
        Ok(self.existing.lock().unwrap().contains(remote_path))
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        if self.failing_sources.lock().unwrap().contains(source) {
            return Err(BatchError::Storage(format!("cannot copy {source}")));
        }
        self.copies
            .lock()
            .unwrap()
            .push((source.to_string(), destination.to_string()));
        Ok(())
    }
}
