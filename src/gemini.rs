use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{GeminiError, PipelineError};
use crate::retry::RetryPolicy;

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

const STREAM_PROGRESS_EVERY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    InlineData(Blob),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn pdf(bytes: &[u8]) -> Self {
        Part::InlineData(Blob {
            mime_type: "application/pdf".to_owned(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub contents: Vec<Content>,
    pub config: GenerationConfig,
}

impl GenerateRequest {
    /// A single user turn made of `parts`.
    pub fn new(model: &str, temperature: f32, parts: Vec<Part>) -> Self {
        Self {
            model: model.to_owned(),
            contents: vec![Content {
                role: Role::User,
                parts,
            }],
            config: GenerationConfig {
                temperature,
                response_mime_type: None,
            },
        }
    }

    pub fn json_response(mut self) -> Self {
        self.config.response_mime_type = Some("application/json".to_owned());
        self
    }

    /// The same request extended with the model's truncated answer and a
    /// follow-up asking it to carry on.
    pub fn continuation(&self, partial: &str, instruction: &str) -> Self {
        let mut next = self.clone();
        next.contents.push(Content {
            role: Role::Model,
            parts: vec![Part::text(partial)],
        });
        next.contents.push(Content {
            role: Role::User,
            parts: vec![Part::text(instruction)],
        });
        next
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    contents: &'a [Content],
    generation_config: &'a GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

impl<'a> RequestBody<'a> {
    fn new(request: &'a GenerateRequest) -> Self {
        Self {
            contents: &request.contents,
            generation_config: &request.config,
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl ResponseChunk {
    fn into_text(self) -> Result<String, GeminiError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(GeminiError::Blocked(reason));
        }
        let mut text = String::new();
        if let Some(content) = self.candidates.into_iter().next().and_then(|c| c.content) {
            for part in content.parts {
                if let Some(part_text) = part.text {
                    text.push_str(&part_text);
                }
            }
        }
        Ok(text)
    }
}

/// Text produced by one model call, however it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Whole(String),
    Streamed(String),
}

impl Response {
    pub fn text(&self) -> &str {
        match self {
            Response::Whole(text) | Response::Streamed(text) => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Response::Whole(text) | Response::Streamed(text) => text,
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api_key = config.api_key()?;
        Self::new(&config.api_base_url, api_key, config.request_timeout())
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/v1beta/models/{model}:{method}", self.base_url)
    }

    async fn post(
        &self,
        url: &str,
        request: &GenerateRequest,
    ) -> Result<reqwest::Response, GeminiError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&RequestBody::new(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = parse_error_message(&raw).unwrap_or(raw);
            return Err(GeminiError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    pub async fn generate_whole(&self, request: &GenerateRequest) -> Result<String, GeminiError> {
        let url = self.endpoint(&request.model, "generateContent");
        let raw = self.post(&url, request).await?.text().await?;
        let chunk: ResponseChunk =
            serde_json::from_str(&raw).map_err(|err| GeminiError::Malformed(err.to_string()))?;
        let text = chunk.into_text()?;
        if text.is_empty() {
            return Err(GeminiError::Empty);
        }
        Ok(text)
    }

    /// Consumes a server-sent-event stream, concatenating chunk texts in the
    /// order they arrive.
    pub async fn generate_streamed(
        &self,
        request: &GenerateRequest,
        operation: &str,
    ) -> Result<String, GeminiError> {
        let url = format!(
            "{}?alt=sse",
            self.endpoint(&request.model, "streamGenerateContent")
        );
        let mut response = self.post(&url, request).await?;

        let mut stream = SseText::default();
        let mut next_report = STREAM_PROGRESS_EVERY;
        while let Some(bytes) = response.chunk().await? {
            stream.feed(&bytes)?;
            if stream.text.len() >= next_report {
                tracing::debug!(operation, chars = stream.text.len(), "streaming progress");
                next_report = stream.text.len() + STREAM_PROGRESS_EVERY;
            }
        }
        let text = stream.finish()?;
        tracing::info!(operation, chars = text.len(), "streaming complete");
        if text.is_empty() {
            return Err(GeminiError::Empty);
        }
        Ok(text)
    }
}

/// Incremental parser for `data: {json}` lines.
#[derive(Debug, Default)]
struct SseText {
    pending: Vec<u8>,
    text: String,
}

impl SseText {
    fn feed(&mut self, bytes: &[u8]) -> Result<(), GeminiError> {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.handle_line(&line)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<String, GeminiError> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.handle_line(&line)?;
        }
        Ok(self.text)
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<(), GeminiError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return Ok(());
        }
        let chunk: ResponseChunk = serde_json::from_str(payload)
            .map_err(|err| GeminiError::Malformed(format!("stream chunk: {err}")))?;
        self.text.push_str(&chunk.into_text()?);
        Ok(())
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

/// A generative model reachable over some transport. [`GeminiClient`] is the
/// production implementation.
#[async_trait]
pub trait ContentModel: Send + Sync {
    async fn generate(
        &self,
        request: &GenerateRequest,
        operation: &str,
        streaming: bool,
    ) -> Result<Response, GeminiError>;
}

#[async_trait]
impl ContentModel for GeminiClient {
    async fn generate(
        &self,
        request: &GenerateRequest,
        operation: &str,
        streaming: bool,
    ) -> Result<Response, GeminiError> {
        if streaming {
            self.generate_streamed(request, operation)
                .await
                .map(Response::Streamed)
        } else {
            self.generate_whole(request).await.map(Response::Whole)
        }
    }
}

/// Runs one generation under `policy`, retrying transport and server
/// failures. Exhaustion becomes [`PipelineError::ContentGeneration`].
pub async fn invoke(
    model: &dyn ContentModel,
    request: &GenerateRequest,
    policy: &RetryPolicy,
    operation: &str,
    streaming: bool,
) -> Result<Response, PipelineError> {
    policy
        .run(operation, GeminiError::is_retryable, |attempt| async move {
            tracing::debug!(operation, attempt, streaming, "model request");
            model.generate(request, operation, streaming).await
        })
        .await
        .map_err(|failure| PipelineError::ContentGeneration {
            operation: operation.to_owned(),
            attempts: failure.attempts,
            source: failure.error,
        })
}
