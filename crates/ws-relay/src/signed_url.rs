use std::time::Duration;

use serde::Deserialize;

use crate::error::SetupError;

/// Production endpoint that trades an agent id for a signed conversation URL.
pub const DEFAULT_SIGNED_URL_ENDPOINT: &str =
    "https://api.elevenlabs.io/v1/convai/conversation/get_signed_url";

/// Header carrying the API key on the signed-URL request.
const API_KEY_HEADER: &str = "xi-api-key";

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// HTTP client for the signed-URL endpoint.
///
/// Every request is bounded by the configured timeout; an expired timeout is
/// reported as [`SetupError::FetchTimeout`].
#[derive(Debug, Clone)]
pub struct SignedUrlClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl SignedUrlClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    /// Request a signed URL for `agent_id`.
    pub async fn fetch(&self, agent_id: &str, api_key: &str) -> Result<String, SetupError> {
        let response = self
            .http
            .get(&self.endpoint)
            .header(API_KEY_HEADER, api_key)
            .query(&[("agent_id", agent_id)])
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                %agent_id,
                status = status.as_u16(),
                %body,
                "signed URL request rejected"
            );
            return Err(SetupError::AuthFailed {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await.map_err(|err| self.classify(err))?;
        let parsed: SignedUrlResponse = serde_json::from_slice(&body)
            .map_err(|err| SetupError::MalformedResponse(err.to_string()))?;

        if parsed.signed_url.is_empty() {
            return Err(SetupError::MalformedResponse(
                "signed_url is empty".to_string(),
            ));
        }

        Ok(parsed.signed_url)
    }

    fn classify(&self, err: reqwest::Error) -> SetupError {
        if err.is_timeout() {
            SetupError::FetchTimeout(self.timeout)
        } else {
            SetupError::Request(err)
        }
    }
}
