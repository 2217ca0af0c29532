//! Remote edit assistance
//!
//! An external service that, given the file and a failed `old_string`,
//! proposes the exact text the caller meant.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("◆ REMOTE ASSIST TIMEOUT")]
    Timeout,

    #[error("◆ REMOTE ASSIST NETWORK ERROR: {0}")]
    Network(String),

    #[error("◆ REMOTE ASSIST API ERROR: {0}")]
    Api(String),

    #[error("◆ REMOTE ASSIST BAD RESPONSE: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::InvalidResponse(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteRequest<'a> {
    pub file_content: &'a str,
    pub old_string: &'a str,
    pub new_string: &'a str,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteResolution {
    pub exact_old_string: String,
    pub confidence: f64,
    #[serde(default)]
    pub line_number: Option<usize>,
}

#[async_trait]
pub trait RemoteAssist: Send + Sync {
    async fn resolve_edit(
        &self,
        file_content: &str,
        old_string: &str,
        new_string: &str,
    ) -> Result<RemoteResolution, RemoteError>;
}

/// `POST {endpoint}/resolve-edit` with a JSON body
pub struct HttpRemoteAssist {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRemoteAssist {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteAssist for HttpRemoteAssist {
    async fn resolve_edit(
        &self,
        file_content: &str,
        old_string: &str,
        new_string: &str,
    ) -> Result<RemoteResolution, RemoteError> {
        let url = format!("{}/resolve-edit", self.endpoint);
        trace!("◆ REMOTE ASSIST REQUEST TO {}", url);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&RemoteRequest {
                file_content,
                old_string,
                new_string,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api(format!("{}: {}", status.as_u16(), body)));
        }

        let resolution: RemoteResolution = response.json().await?;
        if !(0.0..=1.0).contains(&resolution.confidence) {
            return Err(RemoteError::InvalidResponse(format!(
                "confidence out of range: {}",
                resolution.confidence
            )));
        }
        debug!(
            "◆ REMOTE ASSIST RESOLVED WITH CONFIDENCE {:.2}",
            resolution.confidence
        );
        Ok(resolution)
    }
}
