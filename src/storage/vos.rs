use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{BatchError, Result};
use crate::storage::{is_remote, to_remote_path, RemoteStorage};

/// [`RemoteStorage`] backed by the VOSpace command-line tools (`vls`, `vcp`).
#[derive(Debug, Clone)]
pub struct VosClient {
    ls_program: String,
    cp_program: String,
}

impl Default for VosClient {
    fn default() -> Self {
        Self::new("vls", "vcp")
    }
}

impl VosClient {
    pub fn new(ls_program: impl Into<String>, cp_program: impl Into<String>) -> Self {
        Self {
            ls_program: ls_program.into(),
            cp_program: cp_program.into(),
        }
    }

    async fn invoke(&self, program: &str, args: &[String]) -> Result<std::process::Output> {
        tracing::debug!(program, args = ?args, "Running storage command");
        Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BatchError::Storage(format!("failed to run {program}: {e}")))
    }
}

#[async_trait]
impl RemoteStorage for VosClient {
    async fn exists(&self, remote_path: &str) -> Result<bool> {
        let target = to_remote_path(remote_path);
        let output = self.invoke(&self.ls_program, &[target]).await?;
        Ok(output.status.success())
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        let args = [to_remote_path(source), to_remote_path(destination)];
        let direction = match (is_remote(&args[0]), is_remote(&args[1])) {
            (false, true) => "upload",
            (true, false) => "download",
            (true, true) => "remote",
            (false, false) => {
                return Err(BatchError::Storage(format!(
                    "neither {} nor {} is in remote storage",
                    args[0], args[1]
                )))
            }
        };
        let output = self.invoke(&self.cp_program, &args).await?;
        if output.status.success() {
            tracing::info!(source = %args[0], destination = %args[1], direction, "Copied");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(BatchError::Storage(format!(
            "{} {} {} exited with {:?}: {}",
            self.cp_program,
            args[0],
            args[1],
            output.status.code(),
            stderr.trim()
        )))
    }
}
