//! Remote object storage used to stage job inputs and retrieve profiling logs.

pub mod vos;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub use vos::VosClient;

/// Local mount point of the remote project space inside CANFAR containers.
pub const LOCAL_MOUNT_PREFIX: &str = "/arc/";

/// Scheme prefix of the same space in the remote namespace.
pub const REMOTE_SCHEME_PREFIX: &str = "arc:";

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Whether a remote path exists.
    async fn exists(&self, remote_path: &str) -> Result<bool>;

    /// Copy between a local path and a remote path, in either direction.
    async fn copy(&self, source: &str, destination: &str) -> Result<()>;
}

/// Rewrite a path under the local mount into the remote namespace.
/// Paths outside the mount are returned unchanged.
pub fn to_remote_path(path: &str) -> String {
    match path.strip_prefix(LOCAL_MOUNT_PREFIX) {
        Some(rest) => format!("{REMOTE_SCHEME_PREFIX}{rest}"),
        None => path.to_string(),
    }
}

pub fn is_remote(path: &str) -> bool {
    path.starts_with(REMOTE_SCHEME_PREFIX)
}

/// Join a file name onto a remote-or-mount directory using `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Convenience for local sources held as `Path`.
pub fn local_str(path: &Path) -> String {
    path.display().to_string()
}
