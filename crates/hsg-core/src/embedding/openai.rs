//! OpenAI embeddings adapter
//!
//! `POST {base}/embeddings` with bearer auth. Also carries the chat endpoint
//! used by the optional chat surface of the provider trait.

use super::resilience::{with_resilience, CircuitBreaker, RetryPolicy};
use super::{ChatMessage, EmbeddingProvider, ProviderError};
use crate::config::Config;
use crate::types::Sector;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    breaker: CircuitBreaker,
}

impl OpenAiProvider {
    pub fn from_config(cfg: &Config) -> Option<Self> {
        let api_key = cfg.openai_key.clone()?;
        Some(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: cfg.openai_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg
                .openai_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            breaker: CircuitBreaker::new("openai"),
        })
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("openai", &e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("openai", status.as_u16(), &body));
        }
        Ok(resp)
    }

    async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let resp = self.post("/embeddings", body).await?;
        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: "openai",
                message: e.to_string(),
            })?;
        if parsed.data.len() != texts.len() {
            return Err(ProviderError::InvalidResponse {
                provider: "openai",
                message: format!("expected {} vectors, got {}", texts.len(), parsed.data.len()),
            });
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn embed(&self, text: &str, _sector: Option<Sector>) -> Result<Vec<f32>, ProviderError> {
        let texts = vec![text.to_string()];
        let mut vecs = with_resilience(&self.breaker, RetryPolicy::default(), || {
            self.embeddings(&texts)
        })
        .await?;
        vecs.pop().ok_or(ProviderError::InvalidResponse {
            provider: "openai",
            message: "empty embedding response".into(),
        })
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _sector: Option<Sector>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        with_resilience(&self.breaker, RetryPolicy::default(), || {
            self.embeddings(texts)
        })
        .await
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let body = serde_json::json!({ "model": DEFAULT_CHAT_MODEL, "messages": messages });
        let resp = with_resilience(&self.breaker, RetryPolicy::default(), || {
            self.post("/chat/completions", body.clone())
        })
        .await?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: "openai",
                message: e.to_string(),
            })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(ProviderError::InvalidResponse {
                provider: "openai",
                message: "no choices in chat response".into(),
            })
    }

    async fn chat_json(&self, prompt: &str) -> Result<serde_json::Value, ProviderError> {
        let text = self
            .chat(&[ChatMessage {
                role: "user".into(),
                content: format!("{prompt}\nRespond with valid JSON only."),
            }])
            .await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse {
            provider: "openai",
            message: e.to_string(),
        })
    }
}
