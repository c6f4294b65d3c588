//! OpenAI-compatible REST client for embeddings and chat completions.
//!
//! - `POST {endpoint}/v1/embeddings`       (`{model, input}`)
//! - `POST {endpoint}/v1/chat/completions` (`{model, messages, max_tokens, temperature}`)
//!
//! Timeouts are owned by the caller; this client only adds the bearer
//! header and maps provider responses onto the crate error types.

use crate::config::{CompletionSettings, EmbeddingSettings};
use crate::error::body_snippet;
use crate::traits::{CompletionGenerator, EmbeddingGenerator};
use crate::{CompletionError, ConfigError, EmbeddingError};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, info};
use url::Url;

pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com";

const CONTEXT_LENGTH_MARKER: &str = "maximum context length";

#[derive(Debug)]
pub struct OpenAiClient {
    client: Client,
    url_embeddings: Url,
    url_chat: Url,
    embedding: EmbeddingSettings,
    completion: CompletionSettings,
}

impl OpenAiClient {
    pub fn new(
        endpoint: &str,
        api_key: &str,
        embedding: EmbeddingSettings,
        completion: CompletionSettings,
    ) -> Result<Self, ConfigError> {
        if api_key.trim().is_empty() {
            return Err(ConfigError::MissingVar("OPENAI_API_KEY"));
        }

        let base = Url::parse(endpoint.trim_end_matches('/'))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                field: "openai endpoint",
                reason: "must start with http:// or https://".to_string(),
            });
        }

        let mut headers = header::HeaderMap::new();
        let auth = header::HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
            ConfigError::InvalidValue {
                field: "OPENAI_API_KEY",
                reason: format!("not a valid header value: {e}"),
            }
        })?;
        headers.insert(header::AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "openai client",
                reason: e.to_string(),
            })?;

        let base = base.as_str().trim_end_matches('/').to_string();
        let url_embeddings = Url::parse(&format!("{base}/v1/embeddings"))?;
        let url_chat = Url::parse(&format!("{base}/v1/chat/completions"))?;

        info!(
            endpoint = %base,
            embedding_model = %embedding.model,
            completion_model = %completion.model,
            "openai client initialized"
        );

        Ok(Self {
            client,
            url_embeddings,
            url_chat,
            embedding,
            completion,
        })
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[async_trait]
impl EmbeddingGenerator for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let estimated_tokens = estimate_tokens(text);
        if estimated_tokens > self.embedding.max_input_tokens {
            return Err(EmbeddingError::TooLarge {
                estimated_tokens,
                limit: self.embedding.max_input_tokens,
            });
        }

        let started = Instant::now();
        let body = EmbeddingsRequest {
            model: &self.embedding.model,
            input: text,
        };
        debug!(model = %self.embedding.model, input_len = text.len(), "POST {}", self.url_embeddings);

        let response = self
            .client
            .post(self.url_embeddings.clone())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet = body_snippet(&text);
            error!(%status, %snippet, "embeddings request returned non-success status");
            if status == StatusCode::BAD_REQUEST && text.contains(CONTEXT_LENGTH_MARKER) {
                return Err(EmbeddingError::TooLarge {
                    estimated_tokens,
                    limit: self.embedding.max_input_tokens,
                });
            }
            return Err(EmbeddingError::Unavailable(format!("HTTP {status}: {snippet}")));
        }

        let out: EmbeddingsResponse = response.json().await.map_err(|e| {
            EmbeddingError::Unavailable(format!("decode error: {e}; expected `data[0].embedding`"))
        })?;

        let embedding = out
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| EmbeddingError::Unavailable("empty `data` in response".to_string()))?;

        if embedding.len() != self.embedding.dimensions {
            return Err(EmbeddingError::Unavailable(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.embedding.dimensions,
                embedding.len()
            )));
        }

        debug!(
            model = %self.embedding.model,
            latency_ms = started.elapsed().as_millis() as u64,
            "embedding completed"
        );
        Ok(embedding)
    }
}

#[async_trait]
impl CompletionGenerator for OpenAiClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, CompletionError> {
        let started = Instant::now();
        let body = ChatCompletionRequest {
            model: &self.completion.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_message,
                },
            ],
            max_tokens: self.completion.max_tokens,
            temperature: self.completion.temperature,
        };
        debug!(
            model = %self.completion.model,
            system_len = system_prompt.len(),
            "POST {}", self.url_chat
        );

        let response = self.client.post(self.url_chat.clone()).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet = body_snippet(&text);
            error!(%status, %snippet, "chat completion returned non-success status");
            return Err(CompletionError::Unavailable(format!("HTTP {status}: {snippet}")));
        }

        let out: ChatCompletionResponse = response.json().await.map_err(|e| {
            CompletionError::Unavailable(format!(
                "decode error: {e}; expected `choices[0].message.content`"
            ))
        })?;

        let choice = out
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Unavailable("no choices returned".to_string()))?;

        info!(
            model = %self.completion.model,
            latency_ms = started.elapsed().as_millis() as u64,
            "chat completion completed"
        );
        Ok(choice.message.content.unwrap_or_default().trim().to_string())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageOut,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: Option<String>,
}
