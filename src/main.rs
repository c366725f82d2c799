use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use skaha_batch::backend;
use skaha_batch::batch::BatchRunner;
use skaha_batch::config::BatchConfig;
use skaha_batch::error::BatchError;
use skaha_batch::scheduler::{BatchResults, JobOutcome, JobStatus};
use skaha_batch::shutdown::install_shutdown_handler;
use skaha_batch::storage::VosClient;
use skaha_batch::usage::{aggregate_log_dir, UsageReport};

/// Exit code when the batch ran but at least one job did not succeed.
const EXIT_JOBS_FAILED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "skaha-batch")]
#[command(version)]
#[command(about = "Run SoFiA-2 subregion jobs on CANFAR/SKAHA and account for their resource usage")]
#[command(propagate_version = true)]
struct Args {
    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit one headless job per parameter file and wait for all of them
    RunBatch {
        /// Batch configuration file (TOML)
        config: PathBuf,

        /// Override the concurrency limit from the config file
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Override the poll interval (seconds) from the config file
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Cancel the remaining jobs after the first failure
        #[arg(long)]
        fail_fast: bool,
    },

    /// Stage the local image cube and one parameter file, then run that single job
    Submit {
        /// Batch configuration file (TOML); `image_file` is a local path
        config: PathBuf,

        /// Subregion parameter file to run
        parameter_file: PathBuf,

        /// Override the poll interval (seconds) from the config file
        #[arg(long)]
        poll_interval: Option<u64>,
    },

    /// Summarize every profiling log in a directory
    AggregateLogs {
        /// Directory holding the retrieved profiling logs
        directory: PathBuf,

        /// Cores each job was given
        #[arg(long, default_value = "8")]
        cores: u32,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobResultOutput {
    job: String,
    status: String,
    session_id: Option<String>,
    polls: Option<u32>,
    error: Option<String>,
}

#[derive(Serialize)]
struct BatchOutput {
    batch_id: String,
    jobs: Vec<JobResultOutput>,
    succeeded: usize,
    failed: usize,
}

#[derive(Serialize)]
struct UsageLineOutput {
    job: String,
    runtime_seconds: Option<f64>,
    avg_cpu_percent: Option<f64>,
    peak_memory_mb: Option<f64>,
    peak_virtual_memory_mb: Option<f64>,
    cpu_hours: Option<f64>,
    error: Option<String>,
}

#[derive(Serialize)]
struct UsageOutput {
    jobs: Vec<UsageLineOutput>,
    total_cpu_hours: f64,
}

// =============================================================================
// Command Handlers
// =============================================================================

fn job_result_output(name: &str, result: &Result<JobOutcome, BatchError>) -> JobResultOutput {
    match result {
        Ok(outcome) => JobResultOutput {
            job: name.to_string(),
            status: outcome.status.to_string(),
            session_id: Some(outcome.session_id.clone()),
            polls: Some(outcome.polls),
            error: None,
        },
        Err(BatchError::JobFailed(outcome)) => JobResultOutput {
            job: name.to_string(),
            status: JobStatus::Failed.to_string(),
            session_id: Some(outcome.session_id.clone()),
            polls: Some(outcome.polls),
            error: outcome.diagnostic.clone(),
        },
        Err(e) => JobResultOutput {
            job: name.to_string(),
            status: "error".to_string(),
            session_id: None,
            polls: None,
            error: Some(e.to_string()),
        },
    }
}

fn print_batch(
    results: &BatchResults,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs: Vec<JobResultOutput> = results
        .iter()
        .map(|(name, result)| job_result_output(name, result))
        .collect();
    let failed = results.failed().count();

    match output {
        OutputFormat::Json => {
            let out = BatchOutput {
                batch_id: results.batch_id().to_string(),
                succeeded: jobs.len() - failed,
                failed,
                jobs,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("{:<24} {:<10} {:<38} DETAIL", "JOB", "STATUS", "SESSION");
            println!("{}", "-".repeat(84));
            for job in &jobs {
                let detail = match (job.polls, &job.error) {
                    (Some(polls), _) => format!("{polls} polls"),
                    (None, Some(e)) => e.clone(),
                    (None, None) => String::new(),
                };
                println!(
                    "{:<24} {:<10} {:<38} {}",
                    job.job,
                    job.status,
                    job.session_id.as_deref().unwrap_or("-"),
                    detail
                );
            }
            println!();
            println!("{} of {} jobs succeeded", jobs.len() - failed, jobs.len());
        }
    }
    Ok(())
}

fn print_usage(
    report: &UsageReport,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            let jobs = report
                .summaries
                .iter()
                .map(|(name, summary)| match summary {
                    Ok(s) => UsageLineOutput {
                        job: name.clone(),
                        runtime_seconds: Some(s.runtime_seconds),
                        avg_cpu_percent: Some(s.avg_cpu_percent),
                        peak_memory_mb: Some(s.peak_memory_mb),
                        peak_virtual_memory_mb: Some(s.peak_virtual_memory_mb),
                        cpu_hours: Some(s.cpu_hours),
                        error: None,
                    },
                    Err(e) => UsageLineOutput {
                        job: name.clone(),
                        runtime_seconds: None,
                        avg_cpu_percent: None,
                        peak_memory_mb: None,
                        peak_virtual_memory_mb: None,
                        cpu_hours: None,
                        error: Some(e.to_string()),
                    },
                })
                .collect();
            let out = UsageOutput {
                jobs,
                total_cpu_hours: report.total_cpu_hours,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            for (name, summary) in &report.summaries {
                match summary {
                    Ok(s) => println!("{name}: {s}"),
                    Err(e) => println!("{name}: error: {e}"),
                }
            }
            println!("Total CPU hours: {:.4}", report.total_cpu_hours);
        }
    }
    Ok(())
}

/// Which parameter files a run covers and how its cube is found.
enum Selection {
    /// Every `*.par` file in `parameter_file_dir`, cube already remote.
    Batch,
    /// One parameter file; the local cube is staged first.
    Single(PathBuf),
}

fn load_config(config_path: &Path) -> Option<BatchConfig> {
    match BatchConfig::load(config_path) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::error!(config = %config_path.display(), error = %e, "Cannot load batch configuration");
            None
        }
    }
}

async fn run_jobs(
    mut config: BatchConfig,
    selection: Selection,
    output: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    if let Selection::Single(_) = selection {
        config.stage_image = true;
    }
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid batch configuration");
        return Ok(1);
    }

    let backend = match backend::from_config(&config.backend) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(error = %e, "Cannot create session backend");
            return Ok(1);
        }
    };

    let mut runner = BatchRunner::new(config, backend, Arc::new(VosClient::default()))
        .with_cancellation(install_shutdown_handler());
    if let Selection::Single(parameter_file) = selection {
        runner = runner.with_parameter_files(vec![parameter_file]);
    }

    let runs = match runner.prepare().await {
        Ok(runs) => runs,
        Err(e) => {
            tracing::error!(error = %e, "Batch preparation failed, nothing submitted");
            return Ok(1);
        }
    };

    let results = match runner.execute(&runs).await {
        Ok(results) => results,
        Err(e) => {
            tracing::error!(error = %e, "Batch rejected, nothing submitted");
            return Ok(1);
        }
    };
    runner.fetch_profile_logs(&runs).await?;
    print_batch(&results, output)?;

    Ok(if results.all_succeeded() { 0 } else { EXIT_JOBS_FAILED })
}

async fn run_batch(
    config_path: PathBuf,
    max_concurrency: Option<usize>,
    poll_interval: Option<u64>,
    fail_fast: bool,
    output: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(mut config) = load_config(&config_path) else {
        return Ok(1);
    };
    if let Some(n) = max_concurrency {
        config.max_concurrency = n;
    }
    if let Some(secs) = poll_interval {
        config.poll_interval_secs = secs;
    }
    config.fail_fast |= fail_fast;
    run_jobs(config, Selection::Batch, output).await
}

async fn submit(
    config_path: PathBuf,
    parameter_file: PathBuf,
    poll_interval: Option<u64>,
    output: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(mut config) = load_config(&config_path) else {
        return Ok(1);
    };
    if let Some(secs) = poll_interval {
        config.poll_interval_secs = secs;
    }
    run_jobs(config, Selection::Single(parameter_file), output).await
}

fn aggregate_logs(
    directory: PathBuf,
    cores: u32,
    output: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    if !directory.is_dir() {
        tracing::error!(directory = %directory.display(), "Provided logs directory does not exist");
        return Ok(1);
    }
    let report = match aggregate_log_dir(&directory, cores) {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(directory = %directory.display(), error = %e, "No logs to aggregate");
            return Ok(1);
        }
    };
    print_usage(&report, output)?;
    Ok(if report.summarized() > 0 { 0 } else { 1 })
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match args.command {
        Commands::RunBatch {
            config,
            max_concurrency,
            poll_interval,
            fail_fast,
        } => run_batch(config, max_concurrency, poll_interval, fail_fast, &args.output).await?,
        Commands::Submit {
            config,
            parameter_file,
            poll_interval,
        } => submit(config, parameter_file, poll_interval, &args.output).await?,
        Commands::AggregateLogs { directory, cores } => {
            aggregate_logs(directory, cores, &args.output)?
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
