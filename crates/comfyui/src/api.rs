//! The handful of ComfyUI HTTP endpoints a worker exposes to us.
//!
//! Only `/prompt`, `/history/{id}`, `/view` and `/system_stats` are used.

use charforge_core::job::RemoteArtifact;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors from a single ComfyUI HTTP call.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Connection, TLS or body decoding failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The worker answered with a non-2xx status.
    #[error("ComfyUI returned {code}: {body}")]
    Status { code: u16, body: String },
}

/// Body of `POST /prompt`.
#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    prompt: &'a Value,
    client_id: &'a str,
}

/// Reply to `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct PromptQueued {
    pub prompt_id: String,
    /// Queue position at the time of submission.
    #[serde(default)]
    pub number: i32,
}

/// Endpoint calls against one worker's base URL.
///
/// Cheap to build per call; the underlying [`reqwest::Client`] is shared.
#[derive(Clone)]
pub struct ComfyUIApi {
    http: reqwest::Client,
    base: String,
}

impl ComfyUIApi {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn queue_prompt(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<PromptQueued, ComfyUIApiError> {
        let request = self.http.post(self.url("/prompt")).json(&PromptRequest {
            prompt: workflow,
            client_id,
        });
        json(request).await
    }

    /// `GET /history/{id}`; an empty object while the prompt is queued.
    pub async fn history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        json(self.http.get(self.url(&format!("/history/{prompt_id}")))).await
    }

    /// Raw bytes of one output file.
    pub async fn view(&self, artifact: &RemoteArtifact) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.http.get(self.url("/view")).query(&[
            ("filename", artifact.filename.as_str()),
            ("subfolder", artifact.subfolder.as_str()),
            ("type", artifact.folder_type.as_str()),
        ]);
        let response = checked(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn system_stats(&self) -> Result<Value, ComfyUIApiError> {
        json(self.http.get(self.url("/system_stats"))).await
    }
}

async fn checked(request: RequestBuilder) -> Result<Response, ComfyUIApiError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ComfyUIApiError::Status {
        code: status.as_u16(),
        body,
    })
}

async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ComfyUIApiError> {
    Ok(checked(request).await?.json::<T>().await?)
}
