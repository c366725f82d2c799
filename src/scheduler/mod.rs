pub mod job;
pub mod orchestrator;

pub use job::{JobOutcome, JobSpec, JobSpecBuilder, JobStatus, SessionHandle};
pub use orchestrator::{ensure_unique_names, BatchResults, ParallelJobOrchestrator};
