use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, warn};
use vision_payload::{CaptionResult, Captions, FailureKind, ImageTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    Serial,
    Concurrent,
}

impl ExecutionPolicy {
    pub fn from_parallel_flag(parallel: bool) -> Self {
        if parallel {
            Self::Concurrent
        } else {
            Self::Serial
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Concurrent => "concurrent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub policy: ExecutionPolicy,
}

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("caption request timed out after {0:?}")]
    Timeout(Duration),
    #[error("caption request failed: {0}")]
    Transport(String),
    #[error("caption endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("caption response invalid: {0}")]
    InvalidResponse(String),
}

impl CaptionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Transport(_) => FailureKind::Transport,
            Self::Status { .. } => FailureKind::Status,
            Self::InvalidResponse(_) => FailureKind::InvalidResponse,
        }
    }
}

impl From<CaptionError> for CaptionResult {
    fn from(err: CaptionError) -> Self {
        CaptionResult::failure(err.kind(), err.to_string())
    }
}

/// Turns images into text through an OpenAI-style chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct CaptionClient {
    config: Arc<CaptionConfig>,
    http: Client,
}

impl CaptionClient {
    pub fn new(config: CaptionConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .context("failed to build caption HTTP client")?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    pub fn config(&self) -> &CaptionConfig {
        &self.config
    }

    /// Caption every task and key the outcome by its sequence index.
    ///
    /// `authorization` is the caller's credential, used only when no
    /// caption API key is configured. A failed image yields a
    /// `CaptionResult::Failure` for that index; it never fails the batch.
    pub async fn resolve(
        &self,
        tasks: &[ImageTask],
        authorization: Option<HeaderValue>,
    ) -> Captions {
        let mut captions = Captions::new();
        if tasks.is_empty() {
            return captions;
        }

        match self.config.policy {
            ExecutionPolicy::Serial => {
                for task in tasks {
                    let result = self.resolve_one(task, authorization.as_ref()).await;
                    captions.insert(task.index, result);
                }
            }
            ExecutionPolicy::Concurrent => {
                // Dropping the set aborts whatever is still in flight.
                let mut in_flight = JoinSet::new();
                for task in tasks.iter().cloned() {
                    let client = self.clone();
                    let authorization = authorization.clone();
                    in_flight.spawn(
                        async move {
                            let result = client.resolve_one(&task, authorization.as_ref()).await;
                            (task.index, result)
                        }
                        .in_current_span(),
                    );
                }
                while let Some(joined) = in_flight.join_next().await {
                    match joined {
                        Ok((index, result)) => {
                            captions.insert(index, result);
                        }
                        Err(err) => warn!("caption task did not finish: {err}"),
                    }
                }
                for task in tasks {
                    captions.entry(task.index).or_insert_with(|| {
                        CaptionResult::failure(FailureKind::Transport, "caption task did not finish")
                    });
                }
            }
        }
        captions
    }

    async fn resolve_one(
        &self,
        task: &ImageTask,
        authorization: Option<&HeaderValue>,
    ) -> CaptionResult {
        let started = Instant::now();
        match self.describe(task, authorization).await {
            Ok(text) => {
                debug!(
                    "image {} captioned in {:?} ({} chars, {})",
                    task.index,
                    started.elapsed(),
                    text.chars().count(),
                    task.source.summary()
                );
                CaptionResult::Description(text)
            }
            Err(err) => {
                warn!(
                    "image {} caption failed after {:?} [{}]: {err}",
                    task.index,
                    started.elapsed(),
                    err.kind().as_str()
                );
                err.into()
            }
        }
    }

    /// One captioning call, bounded by the configured timeout.
    pub async fn describe(
        &self,
        task: &ImageTask,
        authorization: Option<&HeaderValue>,
    ) -> Result<String, CaptionError> {
        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, self.request_caption(task, authorization))
            .await
            .map_err(|_| CaptionError::Timeout(timeout))?
    }

    async fn request_caption(
        &self,
        task: &ImageTask,
        authorization: Option<&HeaderValue>,
    ) -> Result<String, CaptionError> {
        let mut image_url = json!({ "url": task.source.to_url() });
        if let Some(detail) = &task.detail {
            image_url["detail"] = JsonValue::from(detail.as_str());
        }
        let payload = json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": self.config.prompt},
                    {"type": "image_url", "image_url": image_url}
                ]
            }],
            "max_tokens": self.config.max_tokens
        });

        let mut req = self.http.post(&self.config.endpoint).json(&payload);
        if let Some(api_key) = &self.config.api_key {
            req = req.bearer_auth(api_key);
        } else if let Some(value) = authorization {
            req = req.header(AUTHORIZATION, value.clone());
        }

        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(CaptionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let root: JsonValue = serde_json::from_str(&body)
            .map_err(|e| CaptionError::InvalidResponse(e.to_string()))?;
        caption_text(&root).ok_or_else(|| {
            CaptionError::InvalidResponse(
                "response missing choices[0].message.content".to_string(),
            )
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> CaptionError {
        if err.is_timeout() {
            CaptionError::Timeout(self.config.timeout)
        } else {
            CaptionError::Transport(err.to_string())
        }
    }
}

fn caption_text(root: &JsonValue) -> Option<String> {
    let text = match root.pointer("/choices/0/message/content")? {
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}
