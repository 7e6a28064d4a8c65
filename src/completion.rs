//! Chat-completion client with a bounded primary-to-fallback retry.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::CompletionSettings;
use crate::error::{CoreError, CoreResult};
use crate::message::{ChatMessage, Role};

/// Per-call overrides; any field left unset falls back to the configured
/// defaults in [`CompletionSettings`].
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Model override for this call.
    pub model: Option<String>,
    /// Sampling temperature override.
    pub temperature: Option<f32>,
    /// Completion token budget override.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling override.
    pub top_p: Option<f32>,
    /// Frequency penalty override.
    pub frequency_penalty: Option<f32>,
    /// Presence penalty override.
    pub presence_penalty: Option<f32>,
    /// Disables the fallback retry for this call.
    pub no_fallback: bool,
}

/// Token accounting reported by the completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: Option<u32>,
    /// Tokens generated in the reply.
    pub completion_tokens: Option<u32>,
    /// Prompt plus completion tokens.
    pub total_tokens: Option<u32>,
}

/// A finished completion with the model that actually produced it.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    /// Assistant reply text.
    pub content: String,
    /// Usage reported by the endpoint, when available.
    pub usage: Option<TokenUsage>,
    /// Model id that served the request (fallback id after a fallback).
    pub model_used: String,
}

/// Message shape sent over the wire: role and content only, no timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    /// Speaker role.
    pub role: Role,
    /// Turn text.
    pub content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Fully resolved request handed to a backend: no optional fields left.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    /// Target model id.
    pub model: String,
    /// Ordered message sequence.
    pub messages: Vec<WireMessage>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token budget.
    pub max_tokens: u32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// Frequency penalty.
    pub frequency_penalty: f32,
    /// Presence penalty.
    pub presence_penalty: f32,
    /// Whether the response should stream.
    pub stream: bool,
}

/// Raw result a backend returns for a non-streaming request.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    /// Assistant reply text.
    pub content: String,
    /// Usage reported by the endpoint.
    pub usage: Option<TokenUsage>,
    /// Model id the endpoint reports having used.
    pub model: String,
}

/// Transport seam for completion endpoints; lets tests substitute fakes.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Issues one non-streaming completion request.
    async fn complete(&self, request: CompletionRequest) -> Result<BackendResponse>;

    /// Issues one streaming request, invoking `on_chunk` per text fragment
    /// in arrival order. Resolves once the upstream stream ends.
    async fn stream(
        &self,
        request: CompletionRequest,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<()>;
}

/// Client that resolves options against defaults and bounds the fallback
/// retry to exactly one extra attempt by construction.
#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    settings: CompletionSettings,
}

impl CompletionClient {
    /// Builds a client over the HTTP backend described by `settings`.
    pub fn new(settings: CompletionSettings) -> Result<Self> {
        let backend = HttpCompletionBackend::new(&settings)?;
        Ok(Self::with_backend(settings, Arc::new(backend)))
    }

    /// Builds a client over an arbitrary backend.
    pub fn with_backend(settings: CompletionSettings, backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend, settings }
    }

    /// Configured settings.
    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    /// Sends the message sequence to the primary model; on failure, retries
    /// once against the fallback model unless the request already targeted it
    /// or the caller disabled fallback. Holds no state between calls.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CoreResult<Completion> {
        let request = self.resolve(messages, options, false);
        let fallback_allowed =
            !options.no_fallback && request.model != self.settings.fallback_model;

        let primary_model = request.model.clone();
        let primary_err = match self.backend.complete(request.clone()).await {
            Ok(response) => return Ok(finish(response, primary_model)),
            Err(err) => err,
        };

        if !fallback_allowed {
            return Err(CoreError::Completion(format!("{primary_err:#}")));
        }

        tracing::info!(
            primary = %primary_model,
            fallback = %self.settings.fallback_model,
            "primary completion failed, retrying with fallback model"
        );
        let mut retry = request;
        retry.model = self.settings.fallback_model.clone();
        match self.backend.complete(retry).await {
            Ok(response) => Ok(finish(response, self.settings.fallback_model.clone())),
            Err(fallback_err) => Err(CoreError::Completion(format!(
                "primary ({primary_model}): {primary_err:#}; fallback ({}): {fallback_err:#}",
                self.settings.fallback_model
            ))),
        }
    }

    /// Streams a completion from the primary model, invoking `on_chunk` per
    /// fragment. Errors abort the stream and propagate without fallback.
    pub async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> CoreResult<()> {
        let request = self.resolve(messages, &CompletionOptions::default(), true);
        self.backend
            .stream(request, on_chunk)
            .await
            .map_err(|err| CoreError::Completion(format!("{err:#}")))
    }

    fn resolve(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> CompletionRequest {
        CompletionRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.settings.model.clone()),
            messages: messages.iter().map(WireMessage::from).collect(),
            temperature: options.temperature.unwrap_or(self.settings.temperature),
            max_tokens: options.max_tokens.unwrap_or(self.settings.max_tokens),
            top_p: options.top_p.unwrap_or(self.settings.top_p),
            frequency_penalty: options
                .frequency_penalty
                .unwrap_or(self.settings.frequency_penalty),
            presence_penalty: options
                .presence_penalty
                .unwrap_or(self.settings.presence_penalty),
            stream,
        }
    }
}

fn finish(response: BackendResponse, requested_model: String) -> Completion {
    let model_used = if response.model.is_empty() {
        requested_model
    } else {
        response.model
    };
    Completion {
        content: response.content,
        usage: response.usage,
        model_used,
    }
}

/// Backend speaking the OpenAI-compatible chat-completions wire format.
pub struct HttpCompletionBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCompletionBackend {
    /// Builds the HTTP backend, validating credentials eagerly.
    pub fn new(settings: &CompletionSettings) -> Result<Self> {
        anyhow::ensure!(
            !settings.api_key.trim().is_empty(),
            "missing completion API key"
        );
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", settings.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid completion API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build completion HTTP client")?;
        let endpoint = format!(
            "{}/chat/completions",
            settings.base_url.trim_end_matches('/')
        );
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<BackendResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("failed to call completion endpoint")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("completion endpoint returned {}: {}", status, body);
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .context("failed to parse completion response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .context("completion response contained no choices")?;
        Ok(BackendResponse {
            content,
            usage: parsed.usage,
            model: parsed.model.unwrap_or_default(),
        })
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("failed to call completion endpoint")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("completion endpoint returned {}: {}", status, body);
        }

        // SSE frames can split across network chunks; buffer until a full
        // line is available.
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("error reading completion stream")?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer.drain(..=line_end);
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let frame: StreamFrame =
                    serde_json::from_str(data).context("malformed stream frame")?;
                if let Some(content) = frame
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                {
                    if !content.is_empty() {
                        on_chunk(&content);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
