use std::time::Duration;

use async_trait::async_trait;

use crate::backend::api::{certificate_identity, SessionApi};
use crate::backend::{session_form, JobBackend};
use crate::config::BackendConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::{JobSpec, SessionHandle};

/// Direct REST client for the SKAHA session endpoint, authenticated with a
/// CADC proxy certificate.
#[derive(Debug, Clone)]
pub struct RestBackend {
    api: SessionApi,
}

impl RestBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let cert_path = config.certificate.as_ref().ok_or_else(|| {
            BatchError::Config("REST backend requires a client certificate".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .identity(certificate_identity(cert_path)?)
            .build()?;

        Ok(Self::with_client(
            client,
            &config.session_url,
            &config.image_url,
        ))
    }

    pub fn with_client(client: reqwest::Client, session_url: &str, image_url: &str) -> Self {
        Self {
            api: SessionApi::new(client, session_url, image_url),
        }
    }
}

/// The create call answers with the bare session id.
fn session_id(body: &str) -> Option<&str> {
    Some(body.trim()).filter(|id| !id.is_empty())
}

#[async_trait]
impl JobBackend for RestBackend {
    async fn create(&self, spec: &JobSpec) -> Result<SessionHandle> {
        let (status, body) = self.api.submit(spec.name(), &session_form(spec)).await?;
        session_id(&body)
            .map(SessionHandle::new)
            .ok_or_else(|| BatchError::Submission {
                status,
                body: "empty session id in response".to_string(),
            })
    }

    async fn status(&self, handle: &SessionHandle) -> Result<String> {
        self.api.status(handle).await
    }

    async fn logs(&self, handle: &SessionHandle) -> Result<String> {
        self.api.logs(handle).await
    }

    async fn delete(&self, handle: &SessionHandle) -> Result<()> {
        self.api.delete(handle).await
    }

    async fn images(&self, kind: &str) -> Result<Vec<String>> {
        self.api.images(kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_trimmed_body() {
        assert_eq!(session_id("  d8a1c3f2\n"), Some("d8a1c3f2"));
        assert_eq!(session_id(" \n"), None);
    }

    #[test]
    fn missing_certificate_is_config_error() {
        let config = BackendConfig {
            certificate: Some("/nonexistent/cadcproxy.pem".into()),
            ..BackendConfig::default()
        };
        assert!(matches!(
            RestBackend::new(&config),
            Err(BatchError::Config(_))
        ));

        let config = BackendConfig {
            certificate: None,
            ..BackendConfig::default()
        };
        assert!(matches!(
            RestBackend::new(&config),
            Err(BatchError::Config(_))
        ));
    }
}
