use std::time::Duration;

use reqwest::{Response, StatusCode, header};
use tracing::{debug, warn};

use vitals_core::blob::{Blob, BlobStore, VersionToken};
use vitals_core::error::{Result, StoreError};

const COMMIT_MESSAGE_HEADER: &str = "x-commit-message";

/// Blob backend speaking plain HTTP with `ETag` preconditions.
///
/// `GET {base}/{path}` returns the blob and its `ETag`; `PUT` writes it under
/// `If-Match` (update) or `If-None-Match: *` (create).
pub struct RemoteBlobStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    rt: tokio::runtime::Handle,
}

impl RemoteBlobStore {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        rt: tokio::runtime::Handle,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "vitals-cli/{} (health tracker)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            rt,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request, retrying once on a transient failure.
    async fn send(
        &self,
        path: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Response> {
        let mut retried = false;
        loop {
            let outcome = build().send().await;
            let transient = match &outcome {
                Ok(resp) => matches!(
                    resp.status(),
                    StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT
                ),
                Err(e) => e.is_timeout() || e.is_connect(),
            };
            if transient && !retried {
                warn!(path, "transient failure talking to blob server, retrying once");
                retried = true;
                continue;
            }
            return outcome.map_err(|e| StoreError::backend(format!("request failed: {e}")));
        }
    }

    async fn check_status(path: &str, response: Response) -> Result<Response> {
        let status = response.status();
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(path.to_string())),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Err(StoreError::conflict(path))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::Unauthorized(
                format!("blob server refused access to '{path}' ({status})"),
            )),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::backend(format!(
                    "blob server error {status}: {}",
                    body.trim()
                )))
            }
        }
    }

    fn version_of(path: &str, response: &Response) -> Result<VersionToken> {
        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|raw| VersionToken::new(unquote_etag(raw)))
            .ok_or_else(|| StoreError::backend(format!("blob server sent no ETag for '{path}'")))
    }

    pub async fn get_async(&self, path: &str) -> Result<Blob> {
        let response = self
            .send(path, || self.request(reqwest::Method::GET, path))
            .await?;
        let response = Self::check_status(path, response).await?;
        let version = Self::version_of(path, &response)?;
        let content = response
            .text()
            .await
            .map_err(|e| StoreError::backend(format!("failed to read blob body: {e}")))?;
        debug!(path, %version, bytes = content.len(), "fetched remote blob");
        Ok(Blob { content, version })
    }

    async fn write_async(
        &self,
        path: &str,
        content: &str,
        message: &str,
        precondition: (header::HeaderName, String),
    ) -> Result<VersionToken> {
        let response = self
            .send(path, || {
                self.request(reqwest::Method::PUT, path)
                    .header(precondition.0.clone(), precondition.1.clone())
                    .header(COMMIT_MESSAGE_HEADER, message)
                    .header(header::CONTENT_TYPE, "text/csv; charset=utf-8")
                    .body(content.to_string())
            })
            .await?;
        let response = Self::check_status(path, response).await?;
        Self::version_of(path, &response)
    }

    pub async fn put_async(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &VersionToken,
    ) -> Result<VersionToken> {
        self.write_async(
            path,
            content,
            message,
            (header::IF_MATCH, format!("\"{expected}\"")),
        )
        .await
    }

    pub async fn create_async(
        &self,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<VersionToken> {
        self.write_async(
            path,
            content,
            message,
            (header::IF_NONE_MATCH, "*".to_string()),
        )
        .await
    }
}

/// Strip the weak prefix and quotes from an `ETag` value.
fn unquote_etag(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"').to_string()
}

impl BlobStore for RemoteBlobStore {
    fn get(&self, path: &str) -> Result<Blob> {
        self.rt.block_on(self.get_async(path))
    }

    fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &VersionToken,
    ) -> Result<VersionToken> {
        self.rt
            .block_on(self.put_async(path, content, message, expected))
    }

    fn create(&self, path: &str, content: &str, message: &str) -> Result<VersionToken> {
        self.rt.block_on(self.create_async(path, content, message))
    }
}
