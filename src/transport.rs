//! HTTP transport for feed documents.

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};

/// A GET carrying the validators cached from the previous response
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConditionalRequest {
    /// Feed endpoint
    pub url: String,
    /// Sent as `If-None-Match`
    pub etag: Option<String>,
    /// Sent as `If-Modified-Since`
    pub last_modified: Option<String>,
}

/// Whatever the server answered, regardless of status
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// `ETag` response header
    pub etag: Option<String>,
    /// `Last-Modified` response header
    pub last_modified: Option<String>,
    /// Response body (empty for 304)
    pub body: String,
}

/// Fetches feed documents
///
/// Only failures that prevent a response from arriving are errors; status
/// classification is left to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one conditional GET
    async fn fetch(&self, request: &ConditionalRequest) -> std::result::Result<TransportResponse, FetchError>;
}

/// [`Transport`] on a shared reqwest client
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client with the configured timeout and user agent
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &ConditionalRequest) -> std::result::Result<TransportResponse, FetchError> {
        let mut builder = self.client.get(&request.url);
        if let Some(etag) = &request.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &request.last_modified {
            builder = builder.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = builder.send().await.map_err(classify)?;

        let status = response.status().as_u16();
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        let body = response.text().await.map_err(classify)?;

        Ok(TransportResponse {
            status,
            etag,
            last_modified,
            body,
        })
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(e.to_string())
    } else {
        FetchError::Connection(e.to_string())
    }
}
