//! Speech-to-text adapter.
//!
//! Voice input is forwarded to an OpenAI-compatible transcription endpoint;
//! the engine only ever sees the returned text. The adapter trait keeps the
//! meeting orchestrator testable without audio fixtures.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TranscriptionConfig;
use crate::error::ModelError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transcription seam used by the meeting orchestrator.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe raw audio. An empty string means "nothing intelligible".
    async fn transcribe(
        &self,
        audio: &[u8],
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError>;
}

/// Remote transcription against an OpenAI-compatible `/audio/transcriptions`
/// endpoint.
pub struct RemoteTranscriber {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl RemoteTranscriber {
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            api_key: config.api_key.clone(),
            model: "whisper-1".into(),
        }
    }

    /// Whether a key is configured; without one, voice input is refused
    /// upstream instead of failing per request.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    async fn transcribe(
        &self,
        audio: &[u8],
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        let url = format!(
            "{}/audio/transcriptions",
            self.endpoint.trim_end_matches('/')
        );
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| ModelError::Request {
                message: e.to_string(),
                retryable: false,
            })?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let mut request = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ModelError::Request {
                    message: "request cancelled".into(),
                    retryable: false,
                });
            }
            result = request.send() => result,
        }
        .map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout {
                    timeout_secs: REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                ModelError::Request {
                    message: e.to_string(),
                    retryable: true,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Request {
                message: format!("{status}"),
                retryable: status.is_server_error(),
            });
        }

        let body: serde_json::Value =
            response.json().await.map_err(|e| ModelError::ResponseParse {
                message: e.to_string(),
            })?;
        let text = body
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        debug!(chars = text.len(), "Audio transcribed");
        Ok(text)
    }
}
