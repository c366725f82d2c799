use std::path::Path;

use crate::backend::{parse_images, parse_status, query_body};
use crate::error::{BatchError, Result};
use crate::scheduler::SessionHandle;

/// HTTP calls both session clients make the same way. They differ only in
/// how the client authenticates and how the create response is read.
#[derive(Debug, Clone)]
pub(crate) struct SessionApi {
    client: reqwest::Client,
    session_url: String,
    image_url: String,
}

impl SessionApi {
    pub(crate) fn new(client: reqwest::Client, session_url: &str, image_url: &str) -> Self {
        Self {
            client,
            session_url: session_url.trim_end_matches('/').to_string(),
            image_url: image_url.trim_end_matches('/').to_string(),
        }
    }

    fn session_endpoint(&self, handle: &SessionHandle) -> String {
        format!("{}/{}", self.session_url, handle.id())
    }

    /// POST the create form. Returns the HTTP status and body of a 2xx
    /// response; anything else is a rejected submission.
    pub(crate) async fn submit(
        &self,
        job: &str,
        form: &[(&'static str, String)],
    ) -> Result<(u16, String)> {
        let response = self
            .client
            .post(&self.session_url)
            .form(form)
            .send()
            .await
            .map_err(|e| BatchError::BackendUnavailable(format!("session create failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BatchError::BackendUnavailable(format!("session create body: {e}")))?;
        if !status.is_success() {
            tracing::error!(job, http_status = status.as_u16(), "Session create rejected");
            return Err(BatchError::Submission {
                status: status.as_u16(),
                body,
            });
        }
        Ok((status.as_u16(), body))
    }

    pub(crate) async fn status(&self, handle: &SessionHandle) -> Result<String> {
        let response = self.client.get(self.session_endpoint(handle)).send().await;
        let body = query_body(response, "session status").await?;
        parse_status(&body)
    }

    pub(crate) async fn logs(&self, handle: &SessionHandle) -> Result<String> {
        let response = self
            .client
            .get(self.session_endpoint(handle))
            .query(&[("view", "logs")])
            .send()
            .await;
        query_body(response, "session logs").await
    }

    pub(crate) async fn delete(&self, handle: &SessionHandle) -> Result<()> {
        let response = self.client.delete(self.session_endpoint(handle)).send().await;
        query_body(response, "session delete").await.map(|_| ())
    }

    pub(crate) async fn images(&self, kind: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(&self.image_url)
            .query(&[("type", kind)])
            .send()
            .await;
        let body = query_body(response, "image list").await?;
        parse_images(&body)
    }
}

/// Client identity from a CADC proxy certificate (PEM, certificate and key).
pub(crate) fn certificate_identity(path: &Path) -> Result<reqwest::Identity> {
    let pem = std::fs::read(path).map_err(|e| {
        BatchError::Config(format!("cannot read certificate {}: {e}", path.display()))
    })?;
    Ok(reqwest::Identity::from_pem(&pem)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_trimmed() {
        let api = SessionApi::new(
            reqwest::Client::new(),
            "https://ws-uv.canfar.net/skaha/v0/session/",
            "https://ws-uv.canfar.net/skaha/v0/image/",
        );
        assert_eq!(
            api.session_endpoint(&SessionHandle::new("abc")),
            "https://ws-uv.canfar.net/skaha/v0/session/abc"
        );
        assert_eq!(api.image_url, "https://ws-uv.canfar.net/skaha/v0/image");
    }

    #[test]
    fn unreadable_certificate_is_config_error() {
        assert!(matches!(
            certificate_identity(Path::new("/nonexistent/cadcproxy.pem")),
            Err(BatchError::Config(_))
        ));
    }
}
