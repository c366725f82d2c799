//! Remote execution backends.
//!
//! The lifecycle controller only talks to [`JobBackend`]. Two interchangeable
//! implementations speak the SKAHA session API:
//!
//! - [`RestBackend`]: direct REST calls authenticated with a CADC proxy
//!   certificate; the create call answers with the bare session id.
//! - [`SessionClient`]: a session-object client with bearer-token headers
//!   that requests replicas and reads the session ids back as JSON.

mod api;
pub mod rest;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{BackendConfig, BackendKind};
use crate::error::{BatchError, Result};
use crate::scheduler::{JobSpec, SessionHandle};

pub use rest::RestBackend;
pub use session::SessionClient;

/// Session kind requested for every submitted job.
pub const HEADLESS_KIND: &str = "headless";

#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit a job. A non-success response is `BatchError::Submission`.
    async fn create(&self, spec: &JobSpec) -> Result<SessionHandle>;

    /// Raw status token for the session, e.g. `"Running"`.
    async fn status(&self, handle: &SessionHandle) -> Result<String>;

    /// Captured container output.
    async fn logs(&self, handle: &SessionHandle) -> Result<String>;

    /// Best-effort session kill.
    async fn delete(&self, handle: &SessionHandle) -> Result<()>;

    /// Image ids advertised for the given session kind.
    async fn images(&self, kind: &str) -> Result<Vec<String>>;
}

/// Build the backend selected in the configuration.
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn JobBackend>> {
    match config.kind {
        BackendKind::Rest => Ok(Arc::new(RestBackend::new(config)?)),
        BackendKind::Session => Ok(Arc::new(SessionClient::new(config)?)),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionInfo {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageInfo {
    pub id: String,
}

/// Form fields shared by both session-create flavours.
pub(crate) fn session_form(spec: &JobSpec) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("name", spec.name().to_string()),
        ("image", spec.container_image().to_string()),
        ("cores", spec.cores().to_string()),
        ("ram", spec.ram_gib().to_string()),
        ("kind", HEADLESS_KIND.to_string()),
        ("cmd", spec.command().to_string()),
    ];
    if !spec.args().is_empty() {
        form.push(("args", spec.args().join(" ")));
    }
    for (key, value) in spec.env() {
        form.push(("env", format!("{key}={value}")));
    }
    form
}

/// Read the body of a status/logs/images query, folding every failure mode
/// into `TransientQuery` so the controller retries it.
pub(crate) async fn query_body(
    response: std::result::Result<reqwest::Response, reqwest::Error>,
    what: &str,
) -> Result<String> {
    let response =
        response.map_err(|e| BatchError::TransientQuery(format!("{what} request failed: {e}")))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BatchError::TransientQuery(format!("{what} body unreadable: {e}")))?;
    if !status.is_success() {
        return Err(BatchError::TransientQuery(format!(
            "{what} returned HTTP {}: {}",
            status.as_u16(),
            body.trim()
        )));
    }
    Ok(body)
}

pub(crate) fn parse_status(body: &str) -> Result<String> {
    serde_json::from_str::<SessionInfo>(body)
        .map(|info| info.status)
        .map_err(|e| BatchError::TransientQuery(format!("malformed session status: {e}")))
}

pub(crate) fn parse_images(body: &str) -> Result<Vec<String>> {
    serde_json::from_str::<Vec<ImageInfo>>(body)
        .map(|images| images.into_iter().map(|i| i.id).collect())
        .map_err(|e| BatchError::TransientQuery(format!("malformed image list: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_form_carries_spec_fields() {
        let spec = JobSpec::builder("sofia-1")
            .image("images.canfar.net/srcnet/sofia-task:latest")
            .cores(8)
            .ram_gib(32)
            .command("/bin/bash")
            .arg("arc:projects/x/sofia_1_cmd.sh")
            .env("A", "1")
            .build()
            .unwrap();
        let form = session_form(&spec);
        let get = |k: &str| {
            form.iter()
                .filter(|(key, _)| *key == k)
                .map(|(_, v)| v.as_str())
                .collect::<Vec<_>>()
        };
        assert_eq!(get("name"), ["sofia-1"]);
        assert_eq!(get("cores"), ["8"]);
        assert_eq!(get("ram"), ["32"]);
        assert_eq!(get("kind"), ["headless"]);
        assert_eq!(get("cmd"), ["/bin/bash"]);
        assert_eq!(get("args"), ["arc:projects/x/sofia_1_cmd.sh"]);
        assert_eq!(get("env"), ["A=1"]);
    }

    #[test]
    fn parse_status_reads_status_field() {
        let body = r#"{"id":"abc","status":"Running","type":"headless"}"#;
        assert_eq!(parse_status(body).unwrap(), "Running");
    }

    #[test]
    fn parse_status_malformed_is_transient() {
        let err = parse_status("<html>gateway timeout</html>").unwrap_err();
        assert!(err.is_transient());
        let err = parse_status(r#"{"id":"abc"}"#).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn parse_images_collects_ids() {
        let body = r#"[{"id":"images.canfar.net/a:1","types":["headless"]},{"id":"b"}]"#;
        assert_eq!(
            parse_images(body).unwrap(),
            vec!["images.canfar.net/a:1".to_string(), "b".to_string()]
        );
    }
}
