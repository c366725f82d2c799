use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::backend::JobBackend;
use crate::config::OrchestratorConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::{JobOutcome, JobSpec};
use crate::worker::JobLifecycleController;

/// Outcome of every job in a batch, keyed by job name.
#[derive(Debug)]
pub struct BatchResults {
    batch_id: Uuid,
    results: BTreeMap<String, Result<JobOutcome>>,
    peak_in_flight: usize,
}

impl BatchResults {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn get(&self, name: &str) -> Option<&Result<JobOutcome>> {
        self.results.get(name)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Result<JobOutcome>)> {
        self.results.iter()
    }

    /// Jobs that reached `Succeeded`.
    pub fn succeeded(&self) -> impl Iterator<Item = (&String, &JobOutcome)> {
        self.results
            .iter()
            .filter_map(|(name, result)| result.as_ref().ok().map(|outcome| (name, outcome)))
    }

    /// Jobs that failed, errored or were cancelled.
    pub fn failed(&self) -> impl Iterator<Item = (&String, &BatchError)> {
        self.results
            .iter()
            .filter_map(|(name, result)| result.as_ref().err().map(|e| (name, e)))
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(|r| r.is_ok())
    }

    /// Highest number of controllers that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

}

/// Counts running controllers; the guard releases its slot on drop.
#[derive(Debug, Default)]
struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlightSlot<'a>(&'a InFlightGauge);

impl InFlightGauge {
    fn enter(&self) -> InFlightSlot<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightSlot(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fans a batch of job specs out to a bounded pool of lifecycle controllers.
///
/// Jobs are independent: a failure is recorded in that job's entry and the
/// rest of the batch keeps running, unless `fail_fast` is set.
pub struct ParallelJobOrchestrator {
    backend: Arc<dyn JobBackend>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl ParallelJobOrchestrator {
    pub fn new(backend: Arc<dyn JobBackend>, config: OrchestratorConfig) -> Self {
        Self {
            backend,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the batch to an outer token, e.g. the process shutdown token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every spec to completion with at most `max_concurrency`
    /// controllers in flight.
    ///
    /// # Errors
    ///
    /// Only rejects the batch as a whole, before anything is submitted: a zero
    /// concurrency limit or duplicate job names. Per-job errors are returned
    /// inside [`BatchResults`].
    pub async fn run_all(&self, specs: Vec<JobSpec>) -> Result<BatchResults> {
        if self.config.max_concurrency == 0 {
            return Err(BatchError::Config(
                "max_concurrency must be positive".to_string(),
            ));
        }
        ensure_unique_names(&specs)?;

        let batch_id = Uuid::new_v4();
        tracing::info!(
            batch_id = %batch_id,
            jobs = specs.len(),
            max_concurrency = self.config.max_concurrency,
            fail_fast = self.config.fail_fast,
            "Starting batch"
        );

        let controller = Arc::new(JobLifecycleController::new(
            self.backend.clone(),
            self.config.controller.clone(),
        ));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let gauge = Arc::new(InFlightGauge::default());
        let batch_token = self.cancel.child_token();

        let mut tasks = JoinSet::new();
        let mut names: HashMap<tokio::task::Id, String> = HashMap::new();

        for spec in specs {
            let name = spec.name().to_string();
            let span = tracing::info_span!("job", name = %name, batch_id = %batch_id);
            let worker = JobWorker {
                controller: controller.clone(),
                permits: permits.clone(),
                gauge: gauge.clone(),
                token: batch_token.clone(),
                job_timeout: self.config.job_timeout,
                fail_fast: self.config.fail_fast,
            };
            let handle = tasks.spawn(async move { worker.run(spec).await }.instrument(span));
            names.insert(handle.id(), name);
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(e) => {
                    let id = e.id();
                    (id, Err(BatchError::Internal(format!("job task aborted: {e}"))))
                }
            };
            let Some(name) = names.remove(&id) else {
                continue;
            };
            log_terminal(&name, &result);
            results.insert(name, result);
        }

        let peak_in_flight = gauge.peak();
        let failed = results.values().filter(|r| r.is_err()).count();
        tracing::info!(
            batch_id = %batch_id,
            jobs = results.len(),
            failed,
            peak_in_flight,
            "Batch finished"
        );

        Ok(BatchResults {
            batch_id,
            results,
            peak_in_flight,
        })
    }
}

/// Results are keyed by job name, so a batch may not reuse one.
pub fn ensure_unique_names<'a>(specs: impl IntoIterator<Item = &'a JobSpec>) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name()) {
            return Err(BatchError::InvalidSpec(format!(
                "duplicate job name in batch: {}",
                spec.name()
            )));
        }
    }
    Ok(())
}

/// Everything one spawned job needs; owns clones of the shared handles.
struct JobWorker {
    controller: Arc<JobLifecycleController>,
    permits: Arc<Semaphore>,
    gauge: Arc<InFlightGauge>,
    token: CancellationToken,
    job_timeout: Option<Duration>,
    fail_fast: bool,
}

impl JobWorker {
    async fn run(self, spec: JobSpec) -> Result<JobOutcome> {
        let result = self.run_inner(&spec).await;
        if self.fail_fast && result.is_err() && !self.token.is_cancelled() {
            tracing::warn!(job = spec.name(), "Fail-fast: cancelling remaining jobs");
            self.token.cancel();
        }
        result
    }

    async fn run_inner(&self, spec: &JobSpec) -> Result<JobOutcome> {
        let _permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                return Err(BatchError::Cancelled { session_id: None });
            }
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| BatchError::Cancelled { session_id: None })?
            }
        };
        if self.token.is_cancelled() {
            return Err(BatchError::Cancelled { session_id: None });
        }

        let _slot = self.gauge.enter();
        match self.job_timeout {
            Some(deadline) => {
                self.controller
                    .run_with_deadline(spec, deadline, &self.token)
                    .await
            }
            None => self.controller.run_until(spec, &self.token).await,
        }
    }
}

fn log_terminal(name: &str, result: &Result<JobOutcome>) {
    match result {
        Ok(outcome) => tracing::info!(
            job = name,
            session_id = %outcome.session_id,
            status = %outcome.status,
            "Job finished"
        ),
        Err(BatchError::JobFailed(outcome)) => tracing::error!(
            job = name,
            session_id = %outcome.session_id,
            status = %outcome.status,
            "Job finished"
        ),
        Err(e) => tracing::error!(job = name, error = %e, "Job did not complete"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_peak() {
        let gauge = InFlightGauge::default();
        {
            let _a = gauge.enter();
            let _b = gauge.enter();
            {
                let _c = gauge.enter();
            }
            let _d = gauge.enter();
        }
        assert_eq!(gauge.peak(), 3);
        assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
    }
}
