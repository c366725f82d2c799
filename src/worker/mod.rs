//! Per-job execution against the remote session backend.
//!
//! [`JobLifecycleController`] submits one [`JobSpec`](crate::scheduler::JobSpec),
//! polls the session until it reaches a terminal state and collects the
//! container logs.
//!
//! # Lifecycle
//!
//! 1. `create` the session; a rejected submission fails immediately
//! 2. Poll `status` every `poll_interval`, classifying the raw token
//! 3. Transient query failures are logged and the poll is retried
//! 4. `Succeeded` fetches logs and returns the outcome
//! 5. `Failed` fetches logs and returns [`BatchError::JobFailed`](crate::error::BatchError::JobFailed)

pub mod controller;

pub use controller::JobLifecycleController;
