//! The `run-batch` pipeline: one SoFiA-2 job per subregion parameter file.
//!
//! 1. Discover `*.par` files in the parameter directory
//! 2. Build and validate one job spec per file, rejecting colliding names
//! 3. Check the task image is offered and the data cube is staged remotely,
//!    copying a local cube into the remote directory first when asked to
//! 4. Copy each parameter file and a generated run script to the remote dir
//! 5. Run every job through [`ParallelJobOrchestrator`]
//! 6. Copy the profiling logs back into the local logs directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::{JobBackend, HEADLESS_KIND};
use crate::config::BatchConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::{ensure_unique_names, BatchResults, JobSpec, ParallelJobOrchestrator};
use crate::storage::{join_remote, local_str, RemoteStorage};

pub const PARAMETER_FILE_EXTENSION: &str = "par";
pub const PROFILE_SAMPLE_INTERVAL_SECS: f64 = 0.2;

/// Everything known about one subregion run before it is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubregionRun {
    /// Parameter file stem.
    pub run_id: String,
    pub parameter_file: PathBuf,
    pub remote_parameter_file: String,
    pub script_file: PathBuf,
    pub remote_script: String,
    pub output_dir: String,
    pub remote_profile_log: String,
    pub spec: JobSpec,
}

impl SubregionRun {
    /// Derive paths and the validated job spec for one parameter file.
    pub fn plan(config: &BatchConfig, parameter_file: &Path) -> Result<Self> {
        let file_name = parameter_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                BatchError::Config(format!(
                    "unusable parameter file name: {}",
                    parameter_file.display()
                ))
            })?;
        let run_id = parameter_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name)
            .to_string();
        let script_name = format!("{run_id}_cmd.sh");
        let remote_script = join_remote(&config.vos_dir, &script_name);

        let spec = JobSpec::builder(JobSpec::sanitize_name(&run_id))
            .image(&config.task_image)
            .cores(config.cores)
            .ram_gib(config.ram_gib)
            .command("/bin/bash")
            .arg(&remote_script)
            .build()
            .map_err(|e| match e {
                BatchError::InvalidSpec(reason) => {
                    BatchError::InvalidSpec(format!("{}: {reason}", parameter_file.display()))
                }
                other => other,
            })?;

        Ok(Self {
            parameter_file: parameter_file.to_path_buf(),
            remote_parameter_file: join_remote(&config.vos_dir, file_name),
            script_file: config.parameter_file_dir.join(&script_name),
            remote_script,
            output_dir: join_remote(&config.vos_dir, &run_id),
            remote_profile_log: join_remote(&config.vos_dir, &format!("{run_id}_profile.csv")),
            run_id,
            spec,
        })
    }

    /// Bash script run inside the container: SoFiA-2 under the profiler.
    pub fn render_script(&self, image_file: &str) -> String {
        let sofia = format!(
            "sofia {} input.data={} output.directory={}",
            self.remote_parameter_file, image_file, self.output_dir
        );
        format!(
            "#!/bin/bash\npsrecord \"{sofia}\" --log {} --include-io --interval {PROFILE_SAMPLE_INTERVAL_SECS} --include-children --log-format csv\n",
            self.remote_profile_log
        )
    }

    pub fn local_profile_log(&self, logs_dir: &Path) -> PathBuf {
        let name = self
            .remote_profile_log
            .rsplit('/')
            .next()
            .unwrap_or(&self.remote_profile_log);
        logs_dir.join(name)
    }
}

/// Sorted `*.par` files in `dir`. No files is a configuration error: there
/// is no work to do.
pub fn discover_parameter_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(BatchError::Config(format!(
            "parameter file directory does not exist: {}",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(PARAMETER_FILE_EXTENSION)
        {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(BatchError::Config(format!(
            "no *.{PARAMETER_FILE_EXTENSION} files found in {}",
            dir.display()
        )));
    }
    files.sort();
    Ok(files)
}

/// Remote destination of a local cube staged into `vos_dir`.
pub fn staged_image_path(config: &BatchConfig) -> Result<String> {
    let file_name = Path::new(&config.image_file)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            BatchError::Config(format!("unusable image file name: {}", config.image_file))
        })?;
    Ok(join_remote(&config.vos_dir, file_name))
}

pub struct BatchRunner {
    config: BatchConfig,
    backend: Arc<dyn JobBackend>,
    storage: Arc<dyn RemoteStorage>,
    cancel: CancellationToken,
    parameter_files: Option<Vec<PathBuf>>,
}

impl BatchRunner {
    pub fn new(
        config: BatchConfig,
        backend: Arc<dyn JobBackend>,
        storage: Arc<dyn RemoteStorage>,
    ) -> Self {
        Self {
            config,
            backend,
            storage,
            cancel: CancellationToken::new(),
            parameter_files: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run exactly these parameter files instead of scanning
    /// `parameter_file_dir`.
    pub fn with_parameter_files(mut self, files: Vec<PathBuf>) -> Self {
        self.parameter_files = Some(files);
        self
    }

    fn selected_parameter_files(&self) -> Result<Vec<PathBuf>> {
        match &self.parameter_files {
            None => discover_parameter_files(&self.config.parameter_file_dir),
            Some(files) => {
                if files.is_empty() {
                    return Err(BatchError::Config("no parameter files selected".to_string()));
                }
                if let Some(missing) = files.iter().find(|f| !f.is_file()) {
                    return Err(BatchError::Config(format!(
                        "parameter file does not exist: {}",
                        missing.display()
                    )));
                }
                Ok(files.clone())
            }
        }
    }

    /// Remote path of the data cube the jobs read, staging a local cube
    /// into `vos_dir` first when `stage_image` is set.
    async fn input_image(&self) -> Result<String> {
        if !self.config.stage_image {
            if !self.storage.exists(&self.config.image_file).await? {
                return Err(BatchError::Config(format!(
                    "image file does not exist in remote storage: {}",
                    self.config.image_file
                )));
            }
            return Ok(self.config.image_file.clone());
        }

        if !Path::new(&self.config.image_file).is_file() {
            return Err(BatchError::Config(format!(
                "local image file does not exist: {}",
                self.config.image_file
            )));
        }
        let destination = staged_image_path(&self.config)?;
        self.storage
            .copy(&self.config.image_file, &destination)
            .await?;
        tracing::info!(source = %self.config.image_file, destination = %destination, "Staged image cube");
        Ok(destination)
    }

    /// Validate inputs and stage everything the jobs need. Every job spec
    /// is built and checked before anything is copied, and nothing is
    /// submitted if this fails.
    pub async fn prepare(&self) -> Result<Vec<SubregionRun>> {
        let parameter_files = self.selected_parameter_files()?;
        tracing::info!(count = parameter_files.len(), dir = %self.config.parameter_file_dir.display(), "Found parameter files");

        let runs = parameter_files
            .iter()
            .map(|file| SubregionRun::plan(&self.config, file))
            .collect::<Result<Vec<_>>>()?;
        ensure_unique_names(runs.iter().map(|run| &run.spec))?;

        let images = self.backend.images(HEADLESS_KIND).await?;
        if !images.iter().any(|id| id == &self.config.task_image) {
            return Err(BatchError::Config(format!(
                "task image {} is not an available {HEADLESS_KIND} image",
                self.config.task_image
            )));
        }

        let image_file = self.input_image().await?;
        tracing::info!(image_file = %image_file, "Processing image file");

        for run in &runs {
            self.storage
                .copy(&local_str(&run.parameter_file), &run.remote_parameter_file)
                .await?;
            tokio::fs::write(&run.script_file, run.render_script(&image_file)).await?;
            self.storage
                .copy(&local_str(&run.script_file), &run.remote_script)
                .await?;
            tracing::info!(run_id = %run.run_id, script = %run.remote_script, "Staged run");
        }
        Ok(runs)
    }

    /// Submit one job per staged run and wait for all of them.
    pub async fn execute(&self, runs: &[SubregionRun]) -> Result<BatchResults> {
        let specs = runs.iter().map(|run| run.spec.clone()).collect();
        ParallelJobOrchestrator::new(self.backend.clone(), self.config.orchestrator())
            .with_cancellation(self.cancel.clone())
            .run_all(specs)
            .await
    }

    /// Copy each run's profiling log into `logs_dir`. Returns how many were
    /// retrieved; a failed copy is logged and skipped.
    pub async fn fetch_profile_logs(&self, runs: &[SubregionRun]) -> Result<usize> {
        tokio::fs::create_dir_all(&self.config.logs_dir).await?;
        let mut fetched = 0;
        for run in runs {
            let destination = run.local_profile_log(&self.config.logs_dir);
            match self
                .storage
                .copy(&run.remote_profile_log, &local_str(&destination))
                .await
            {
                Ok(()) => fetched += 1,
                Err(e) => {
                    tracing::warn!(run_id = %run.run_id, error = %e, "Could not retrieve profile log")
                }
            }
        }
        tracing::info!(fetched, total = runs.len(), logs_dir = %self.config.logs_dir.display(), "Copied profile logs");
        Ok(fetched)
    }

    /// Full pipeline: prepare, execute, retrieve logs.
    pub async fn run(&self) -> Result<BatchResults> {
        let runs = self.prepare().await?;
        let results = self.execute(&runs).await?;
        self.fetch_profile_logs(&runs).await?;
        Ok(results)
    }
}
