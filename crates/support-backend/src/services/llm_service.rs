//! LLM Gateway: blocking and streaming generation behind a single tagged
//! response variant (`LlmResponse`), replacing the dynamic
//! `text | answer | answer.text | response | content` shape-probing a naive
//! orchestrator would need. Dispatches on
//! `LlmConfig::provider` (`ollama` | `gemini`).

use crate::config::LlmConfig;
use crate::utils::error::ApiError;
use crate::utils::retry::{retry_with_backoff, RetryPolicy};
use anyhow::{Context, Result};
use futures::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::pin::Pin;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    fn estimate(prompt: &str, completion: &str) -> Self {
        let input_tokens = estimate_tokens(prompt);
        let output_tokens = estimate_tokens(completion);
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

fn estimate_tokens(text: &str) -> u32 {
    ((text.len() as f64) / 4.0).ceil() as u32
}

/// The one shape every caller sees; no downstream code matches on ad-hoc
/// provider JSON fields.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount")]
    total_token_count: u32,
}

impl LlmService {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }

    /// Cheap, local readiness signal for `/health`: a non-empty base URL and
    /// model name, without making a network call.
    pub fn is_configured(&self) -> bool {
        !self.config.base_url.is_empty() && !self.config.model.is_empty()
    }

    pub async fn generate(&self, messages: Vec<ChatMessage>) -> Result<LlmResponse, ApiError> {
        let policy = RetryPolicy::default();
        let messages = &messages;
        retry_with_backoff(policy, |_: &anyhow::Error| true, || self.call_generate(messages))
            .await
            .map_err(|e| ApiError::LlmError(e.to_string()))
    }

    async fn call_generate(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        match self.config.provider.as_str() {
            "gemini" => self.generate_gemini(messages).await,
            _ => self.generate_openai_compatible(messages).await,
        }
    }

    async fn generate_openai_compatible(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let request = OpenAiChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: false,
        };

        let mut builder = self.client.post(&url);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.json(&request).send().await.context("LLM request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error ({}): {}", status, body);
        }

        let body: OpenAiChatResponse = response.json().await.context("Failed to parse LLM response")?;
        let text = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("LLM returned no choices"))?;

        let prompt_text: String = messages.iter().map(|m| m.content.as_str()).collect();
        let usage = body
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_else(|| TokenUsage::estimate(&prompt_text, &text));

        Ok(LlmResponse { text, usage })
    }

    async fn generate_gemini(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("gemini provider requires llm.api_key"))?;
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.config.model, key
        );

        let system_prompt: String = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let contents: Vec<_> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                json!({
                    "role": if m.role == "assistant" { "model" } else { "user" },
                    "parts": [{"text": m.content}],
                })
            })
            .collect();

        let body = json!({
            "contents": contents,
            "systemInstruction": {"parts": [{"text": system_prompt}]},
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_tokens,
            },
        });

        let response = self.client.post(&url).json(&body).send().await.context("Gemini request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error ({}): {}", status, err_body);
        }

        let parsed: GeminiResponse = response.json().await.context("Failed to parse Gemini response")?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| anyhow::anyhow!("Gemini returned no candidates"))?;

        let prompt_text: String = messages.iter().map(|m| m.content.as_str()).collect();
        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_else(|| TokenUsage::estimate(&prompt_text, &text));

        Ok(LlmResponse { text, usage })
    }

    /// Streams deltas for `ollama`/OpenAI-compatible providers via SSE.
    /// Gemini has no streaming path wired here; it yields its full answer
    /// as a single delta (documented in DESIGN.md).
    pub async fn generate_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream, ApiError> {
        if self.config.provider == "gemini" {
            let response = self.call_generate(&messages).await.map_err(|e| ApiError::LlmError(e.to_string()))?;
            return Ok(Box::pin(stream::once(async move { Ok(response.text) })));
        }

        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let request = OpenAiChatRequest {
            model: &self.config.model,
            messages: &messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
        };

        let mut builder = self.client.post(&url);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::LlmError(format!("LLM stream request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LlmError(format!("LLM API error ({status}): {body}")));
        }

        let byte_stream = response.bytes_stream();
        let stream = stream::unfold(
            (byte_stream, Vec::<u8>::new()),
            move |(mut bytes, mut buf)| async move {
                loop {
                    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line = buf.drain(..=pos).collect::<Vec<u8>>();
                        let line = String::from_utf8_lossy(&line);
                        let line = line.trim();
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data == "[DONE]" {
                            return None;
                        }
                        if let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(data) {
                            if let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
                                return Some((Ok(delta), (bytes, buf)));
                            }
                        }
                        continue;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => return Some((Err(anyhow::anyhow!("stream error: {e}")), (bytes, buf))),
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
