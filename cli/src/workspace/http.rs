//! The HTTP capability seam.
//!
//! All remote downloads go through [`HttpClient`]; the production
//! implementation wraps `reqwest` with a per-request timeout, tests use an
//! in-memory route table that counts requests.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::workspace::errors::FetchError;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET a resource into memory.
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError>;

    /// GET a resource and stream it to `destination`. Returns the status
    /// code; no file is left behind on a non-success status.
    async fn download(&self, url: &str, destination: &Path) -> Result<u16, FetchError>;
}

/// Production client over `reqwest`.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(ReqwestClient { client })
    }

    fn map_error(url: &str, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::map_error(url, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(url, e))?
            .to_vec();
        Ok(HttpResponse { status, body })
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<u16, FetchError> {
        let response = self.get(url).await?;
        if response.is_success() {
            tokio::fs::write(destination, &response.body)
                .await
                .map_err(|e| FetchError::Network {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(response.status)
    }
}
