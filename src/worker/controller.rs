use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::JobBackend;
use crate::config::ControllerConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::{JobOutcome, JobSpec, JobStatus, SessionHandle};

/// Transient failures tolerated when fetching logs of a finished session.
const LOG_FETCH_ATTEMPTS: u32 = 3;

/// Drives one job from submission to a terminal state.
///
/// The poll loop is a small state machine: a non-terminal status sleeps for
/// the poll interval and polls again; `Succeeded` and `Failed` fetch the
/// container logs and leave the loop. The inter-poll wait is the only
/// suspension point that observes cancellation.
#[derive(Clone)]
pub struct JobLifecycleController {
    backend: Arc<dyn JobBackend>,
    config: ControllerConfig,
}

impl JobLifecycleController {
    pub fn new(backend: Arc<dyn JobBackend>, config: ControllerConfig) -> Self {
        Self { backend, config }
    }

    /// Run a job until the backend reports a terminal state. There is no
    /// upper bound on how long this polls.
    ///
    /// Returns the outcome on success. A terminal `Failed` comes back as
    /// [`BatchError::JobFailed`] carrying the outcome with the container log
    /// as diagnostic.
    pub async fn run(&self, spec: &JobSpec) -> Result<JobOutcome> {
        self.drive(spec, &CancellationToken::new(), None).await
    }

    /// Like [`run`](Self::run), but gives up when `cancel` fires, killing the
    /// session on a best-effort basis.
    pub async fn run_until(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        self.drive(spec, cancel, None).await
    }

    /// Like [`run_until`](Self::run_until) with an additional deadline
    /// measured from the moment of the call.
    pub async fn run_with_deadline(
        &self,
        spec: &JobSpec,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        self.drive(spec, cancel, Some(Instant::now() + deadline)).await
    }

    async fn drive(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<JobOutcome> {
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled { session_id: None });
        }

        let job = spec.name();
        let submitted_at = Utc::now();
        tracing::info!(
            job,
            image = spec.container_image(),
            cores = spec.cores(),
            ram_gib = spec.ram_gib(),
            "Submitting job"
        );

        let handle = match self.backend.create(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(job, error = %e, "Job submission failed");
                return Err(e);
            }
        };
        tracing::info!(job, session_id = %handle, "Session created");

        let mut polls: u32 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut last_status: Option<JobStatus> = None;

        loop {
            polls += 1;
            match self.backend.status(&handle).await {
                Ok(token) => {
                    consecutive_failures = 0;
                    let status = JobStatus::classify(&token);

                    if status == JobStatus::Unknown {
                        tracing::warn!(job, session_id = %handle, raw_status = %token, "Unrecognized session status, still polling");
                    } else if last_status != Some(status) {
                        tracing::info!(job, session_id = %handle, status = %status, polls, "Job status changed");
                    } else {
                        tracing::debug!(job, session_id = %handle, status = %status, polls, "Job status unchanged");
                    }
                    last_status = Some(status);

                    if status.is_terminal() {
                        return self.finish(spec, handle, status, polls, submitted_at).await;
                    }
                }
                Err(e) if e.is_transient() => {
                    consecutive_failures += 1;
                    tracing::warn!(job, session_id = %handle, error = %e, consecutive_failures, "Status query failed, retrying");
                    if let Some(limit) = self.config.max_consecutive_query_failures {
                        if consecutive_failures >= limit {
                            tracing::error!(job, session_id = %handle, consecutive_failures, "Backend unreachable, giving up on job");
                            return Err(BatchError::BackendUnavailable(format!(
                                "{consecutive_failures} consecutive status queries failed for session {handle}: {e}"
                            )));
                        }
                    }
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(job, session_id = %handle, "Job cancelled");
                    return Err(self.abandon(spec, &handle).await);
                }
                _ = deadline_elapsed(deadline) => {
                    tracing::warn!(job, session_id = %handle, "Job deadline elapsed");
                    return Err(self.abandon(spec, &handle).await);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn finish(
        &self,
        spec: &JobSpec,
        handle: SessionHandle,
        status: JobStatus,
        polls: u32,
        submitted_at: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        let job = spec.name();
        let log_text = self.fetch_logs(spec, &handle).await;
        let completed_at = Utc::now();

        if status == JobStatus::Succeeded {
            tracing::info!(job, session_id = %handle, status = %status, polls, "Job succeeded");
            tracing::debug!(job, session_id = %handle, logs = %log_text, "Container output");
            return Ok(JobOutcome {
                session_id: handle.id().to_string(),
                status,
                log_text,
                diagnostic: None,
                polls,
                submitted_at,
                completed_at,
            });
        }

        tracing::error!(job, session_id = %handle, status = %status, polls, logs = %log_text, "Job failed");
        Err(BatchError::JobFailed(Box::new(JobOutcome {
            session_id: handle.id().to_string(),
            status,
            diagnostic: Some(log_text.clone()),
            log_text,
            polls,
            submitted_at,
            completed_at,
        })))
    }

    /// Logs of a finished session. A persistently failing fetch yields an
    /// empty log rather than turning a finished job into an error.
    async fn fetch_logs(&self, spec: &JobSpec, handle: &SessionHandle) -> String {
        for attempt in 1..=LOG_FETCH_ATTEMPTS {
            match self.backend.logs(handle).await {
                Ok(text) => return text,
                Err(e) => {
                    tracing::warn!(job = spec.name(), session_id = %handle, attempt, error = %e, "Log fetch failed");
                    if !e.is_transient() || attempt == LOG_FETCH_ATTEMPTS {
                        break;
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        String::new()
    }

    /// Best-effort log capture and session kill for a job we stop waiting on.
    async fn abandon(&self, spec: &JobSpec, handle: &SessionHandle) -> BatchError {
        let job = spec.name();
        match self.backend.logs(handle).await {
            Ok(text) => tracing::warn!(job, session_id = %handle, logs = %text, "Logs of abandoned session"),
            Err(e) => tracing::debug!(job, session_id = %handle, error = %e, "No logs for abandoned session"),
        }
        if let Err(e) = self.backend.delete(handle).await {
            tracing::warn!(job, session_id = %handle, error = %e, "Failed to delete abandoned session");
        }
        BatchError::Cancelled {
            session_id: Some(handle.id().to_string()),
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
