use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use crate::backend::api::{certificate_identity, SessionApi};
use crate::backend::{session_form, JobBackend};
use crate::config::BackendConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::{JobSpec, SessionHandle};

/// Session-object client: authentication lives in the client's default
/// headers and session creation asks for an explicit replica count, reading
/// the issued ids back as a JSON array.
#[derive(Debug, Clone)]
pub struct SessionClient {
    api: SessionApi,
}

impl SessionClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.request_timeout_secs));

        if let Some(token) = &config.token {
            let mut headers = HeaderMap::new();
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| BatchError::Config(format!("invalid bearer token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        } else if let Some(cert_path) = &config.certificate {
            builder = builder.identity(certificate_identity(cert_path)?);
        } else {
            return Err(BatchError::Config(
                "session client requires a token or a certificate".to_string(),
            ));
        }

        Ok(Self {
            api: SessionApi::new(builder.build()?, &config.session_url, &config.image_url),
        })
    }
}

/// The create call answers with a JSON list of ids, one per replica.
fn first_session_id(body: &str) -> Option<String> {
    let ids: Vec<String> = serde_json::from_str(body).ok()?;
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .find(|id| !id.is_empty())
}

#[async_trait]
impl JobBackend for SessionClient {
    async fn create(&self, spec: &JobSpec) -> Result<SessionHandle> {
        let mut form = session_form(spec);
        form.push(("replicas", "1".to_string()));

        let (status, body) = self.api.submit(spec.name(), &form).await?;
        first_session_id(&body)
            .map(SessionHandle::new)
            .ok_or_else(|| BatchError::Submission {
                status,
                body: format!("no session id in response: {}", body.trim()),
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
    fn first_session_id_takes_first_non_empty() {
        assert_eq!(first_session_id(r#"["abc123"]"#), Some("abc123".to_string()));
        assert_eq!(
            first_session_id(r#"["", " def "]"#),
            Some("def".to_string())
        );
        assert_eq!(first_session_id("[]"), None);
        assert_eq!(first_session_id("abc123"), None);
    }

    #[test]
    fn token_auth_does_not_need_certificate() {
        let config = BackendConfig {
            token: Some("secret".to_string()),
            certificate: None,
            ..BackendConfig::default()
        };
        assert!(SessionClient::new(&config).is_ok());
    }

    #[test]
    fn no_credentials_is_config_error() {
        let config = BackendConfig {
            token: None,
            certificate: None,
            ..BackendConfig::default()
        };
        assert!(matches!(
            SessionClient::new(&config),
            Err(BatchError::Config(_))
        ));
    }
}
