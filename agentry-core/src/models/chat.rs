//! OpenAI-compatible chat completions.
//!
//! One wire client serves every provider in the catalog plus the fallback
//! endpoint. Network errors and 5xx responses are retryable; 4xx other than
//! rate limits are not. Every call is bounded by a 30-second deadline and a
//! request-scoped cancellation token.

use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ModelConfig;
use crate::error::ModelError;
use crate::types::{ChatMessage, ChatRole, Completion, TokenUsage, ToolCall, ToolDefinition};

/// Default deadline for one provider call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One event on a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// A token (or token group) as the provider produced it.
    Token(String),
    /// The stream finished normally.
    Done,
    /// The stream failed mid-flight.
    Failed(String),
}

/// The chat-completion wire client.
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// One chat completion call.
    pub async fn chat_completion(
        &self,
        config: &ModelConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        cancel: &CancellationToken,
    ) -> Result<Completion, ModelError> {
        let body = build_request(config, messages, tools, false);
        let request = self.post(config, body);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Chat completion cancelled");
                return Err(ModelError::Request {
                    message: "request cancelled".into(),
                    retryable: false,
                });
            }
            result = request => result,
        }?;

        let value: Value = response.json().await.map_err(|e| ModelError::ResponseParse {
            message: e.to_string(),
        })?;
        parse_completion(&value)
    }

    /// Chat completion with retry on transient failures (exponential
    /// backoff, rate-limit hints honoured).
    pub async fn chat_completion_with_retry(
        &self,
        config: &ModelConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        cancel: &CancellationToken,
        max_retries: usize,
    ) -> Result<Completion, ModelError> {
        let mut last_error = None;
        for attempt in 0..=max_retries {
            match self.chat_completion(config, messages, tools, cancel).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let backoff = 1u64 << attempt;
                    let wait = match &e {
                        ModelError::RateLimited { retry_after_secs } => {
                            backoff.max(*retry_after_secs)
                        }
                        _ => backoff,
                    };
                    info!(
                        attempt = attempt + 1,
                        max_retries,
                        backoff_secs = wait,
                        error = %e,
                        "Retrying after transient provider error"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
                        _ = cancel.cancelled() => {
                            return Err(ModelError::Request {
                                message: "request cancelled".into(),
                                retryable: false,
                            });
                        }
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(ModelError::Request {
            message: "retries exhausted".into(),
            retryable: false,
        }))
    }

    /// Start a streamed completion. Token deltas arrive on the returned
    /// channel; the stream ends with `Done` or `Failed`.
    pub async fn stream_completion(
        &self,
        config: &ModelConfig,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamDelta>, ModelError> {
        let body = build_request(config, messages, None, true);
        let response = self.post(config, body).await?;

        let (tx, rx) = mpsc::channel(64);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = cancel.cancelled() => {
                        debug!("Streamed completion cancelled");
                        return;
                    }
                };
                let Some(chunk) = chunk else {
                    let _ = tx.send(StreamDelta::Done).await;
                    return;
                };
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamDelta::Failed(e.to_string())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Drain complete SSE lines; keep the partial tail.
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        let _ = tx.send(StreamDelta::Done).await;
                        return;
                    }
                    if let Some(token) = parse_stream_chunk(data) {
                        if tx.send(StreamDelta::Token(token)).await.is_err() {
                            return; // subscriber gone
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn post(
        &self,
        config: &ModelConfig,
        body: Value,
    ) -> Result<reqwest::Response, ModelError> {
        let url = format!(
            "{}/chat/completions",
            config.endpoint.trim_end_matches('/')
        );
        let mut request = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body);
        if let Some(key) = &config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout {
                    timeout_secs: REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                // Connection-level failures are worth one more attempt.
                ModelError::Request {
                    message: e.to_string(),
                    retryable: true,
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(10);
            return Err(ModelError::RateLimited { retry_after_secs });
        }

        let retryable = status.is_server_error();
        let detail = response.text().await.unwrap_or_default();
        warn!(status = %status, model = %config.model, "Provider request failed");
        Err(ModelError::Request {
            message: format!("{status}: {}", crate::types::truncate_utf8(&detail, 500)),
            retryable,
        })
    }
}

/// Build the OpenAI-format request body.
fn build_request(
    config: &ModelConfig,
    messages: &[ChatMessage],
    tools: Option<&[ToolDefinition]>,
    stream: bool,
) -> Value {
    let mut body = json!({
        "model": config.model,
        "messages": messages_to_json(messages),
    });
    if let Some(tools) = tools {
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools_to_json(tools));
        }
    }
    if stream {
        body["stream"] = Value::Bool(true);
    }
    body
}

fn messages_to_json(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            ChatRole::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content,
            }),
            ChatRole::Assistant if !msg.tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
                "tool_calls": msg.tool_calls.iter().map(|call| json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                })).collect::<Vec<_>>(),
            }),
            role => json!({
                "role": role.to_string(),
                "content": msg.content,
            }),
        })
        .collect()
}

fn tools_to_json(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

/// Parse an OpenAI-format response body.
fn parse_completion(body: &Value) -> Result<Completion, ModelError> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ModelError::ResponseParse {
            message: "no choices in response".into(),
        })?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let function = tc.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let args_str = function.get("arguments")?.as_str()?;
                    let arguments: Value = serde_json::from_str(args_str).unwrap_or(json!({}));
                    Some(ToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = body
        .get("usage")
        .map(|u| TokenUsage {
            input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(Completion {
        content,
        tool_calls,
        usage,
    })
}

/// Extract the delta token from one streamed SSE chunk.
fn parse_stream_chunk(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    let token = value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
