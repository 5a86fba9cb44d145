//! Direct Document Processor
//!
//! Client for the external service that handles document-attachment tasks
//! without involving registered workers. The response body streams back
//! chunk by chunk so the user's stream fills while processing runs.

use futures::StreamExt;
use thiserror::Error;
use tracing::debug;

use iris_common::TaskFile;

/// Errors from the direct bypass path.
#[derive(Debug, Error)]
pub enum DirectError {
    /// No processor endpoint is configured.
    #[error("Direct processor is not configured")]
    NotConfigured,

    /// The processor call failed.
    #[error("Direct processor request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The processor returned nothing usable.
    #[error("Direct processor returned an empty response")]
    EmptyResponse,
}

/// External document processor client.
pub struct DirectProcessor {
    http: reqwest::Client,
    endpoint: Option<String>,
}

impl DirectProcessor {
    #[must_use]
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Process a document task, invoking `on_chunk` for each piece of the
    /// streamed response. Returns the full response text.
    pub async fn process(
        &self,
        prompt: &str,
        files: &[TaskFile],
        mut on_chunk: impl FnMut(String),
    ) -> Result<String, DirectError> {
        let endpoint = self.endpoint.as_ref().ok_or(DirectError::NotConfigured)?;

        let response = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({ "prompt": prompt, "files": files }))
            .send()
            .await?
            .error_for_status()?;

        let mut body = response.bytes_stream();
        let mut full = String::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let text = String::from_utf8_lossy(&chunk).into_owned();
            full.push_str(&text);
            on_chunk(text);
        }

        debug!(bytes = full.len(), "Direct processor finished");

        if full.trim().is_empty() {
            return Err(DirectError::EmptyResponse);
        }
        Ok(full)
    }
}
