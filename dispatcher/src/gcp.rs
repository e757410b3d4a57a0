// Shared plumbing for the Google REST clients (storage, datastore,
// life sciences, cloud tasks).

use gcp_auth::TokenProvider;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};

use crate::error::{DispatchError, Result};

pub const CLOUD_PLATFORM: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Clone)]
pub struct GoogleApi {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for GoogleApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleApi")
            .field("http", &self.http)
            .field("tokens", &"<TokenProvider>")
            .finish()
    }
}

impl GoogleApi {
    /// Discovers credentials from the environment (metadata server,
    /// `GOOGLE_APPLICATION_CREDENTIALS`, gcloud).
    pub async fn from_environment() -> Result<Self> {
        let tokens = gcp_auth::provider()
            .await
            .map_err(|e| DispatchError::Config(format!("failed to initialize GCP auth: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DispatchError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { http, tokens })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn token(&self) -> Result<String> {
        let token = self
            .tokens
            .token(&[CLOUD_PLATFORM])
            .await
            .map_err(|e| DispatchError::TransientUpstream(format!("failed to get access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    /// Sends an authorized request; non-2xx responses become errors.
    pub async fn send(&self, req: RequestBuilder, context: &str) -> Result<Response> {
        let token = self.token().await?;
        let resp = req.bearer_auth(token).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DispatchError::from_status(status, context, &body))
    }

    pub async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, context: &str) -> Result<T> {
        let resp = self.send(req, context).await?;
        Ok(resp.json::<T>().await?)
    }
}

/// RFC 3986 percent-encoding of everything but unreserved characters.
pub fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Same as [`encode_component`] but keeps `/` separators.
pub fn encode_path(path: &str) -> String {
    path.split('/').map(encode_component).collect::<Vec<_>>().join("/")
}

/// Duration in the `"{secs}s"` form the Google JSON APIs expect.
pub fn duration_string(d: Duration) -> String {
    format!("{}s", d.as_secs())
}
