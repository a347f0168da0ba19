//! Batched embedding calls against an OpenAI-compatible endpoint.
//!
//! Requests are batched at 32 texts; vectors come back in input order.

use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ModelConfig;
use crate::error::ModelError;

/// Batch size for bulk embedding calls.
pub const EMBED_BATCH_SIZE: usize = 32;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The embeddings wire client.
#[derive(Clone)]
pub struct EmbeddingClient {
    client: Client,
}

impl Default for EmbeddingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Embed `texts`, preserving input order across batches.
    pub async fn embed(
        &self,
        config: &ModelConfig,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let mut chunk = self.embed_batch(config, batch, cancel).await?;
            vectors.append(&mut chunk);
        }
        debug!(count = vectors.len(), model = %config.model, "Embeddings computed");
        Ok(vectors)
    }

    async fn embed_batch(
        &self,
        config: &ModelConfig,
        batch: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, ModelError> {
        let url = format!("{}/embeddings", config.endpoint.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({"model": config.model, "input": batch}));
        if let Some(key) = &config.api_key {
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
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }

        let body: Value = response.json().await.map_err(|e| ModelError::ResponseParse {
            message: e.to_string(),
        })?;
        parse_embeddings(&body, batch.len())
    }
}

/// Parse the `data` array, restoring input order via each entry's `index`.
fn parse_embeddings(body: &Value, expected: usize) -> Result<Vec<Vec<f32>>, ModelError> {
    let data = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ModelError::ResponseParse {
            message: "no data array in embeddings response".into(),
        })?;

    let mut vectors: Vec<Option<Vec<f32>>> = vec![None; expected];
    for entry in data {
        let index = entry.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
        let embedding = entry
            .get("embedding")
            .and_then(|e| e.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect::<Vec<f32>>()
            })
            .ok_or_else(|| ModelError::ResponseParse {
                message: "entry missing embedding".into(),
            })?;
        if index < expected {
            vectors[index] = Some(embedding);
        }
    }

    vectors
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ModelError::ResponseParse {
            message: "embeddings response incomplete".into(),
        })
}
