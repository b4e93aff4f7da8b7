//! Gemini embeddings adapter
//!
//! `POST {model}:batchEmbedContents` on the Generative Language API. One
//! request covers a whole batch, which is why batch ingest prefers it.

use super::resilience::{with_resilience, CircuitBreaker, RetryPolicy};
use super::{EmbeddingProvider, ProviderError};
use crate::config::Config;
use crate::types::Sector;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "models/text-embedding-004";

#[derive(Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    breaker: CircuitBreaker,
}

impl GeminiProvider {
    pub fn from_config(cfg: &Config) -> Option<Self> {
        let api_key = cfg.gemini_key.clone()?;
        Some(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_key,
            model: cfg
                .gemini_embedding_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            breaker: CircuitBreaker::new("gemini"),
        })
    }

    async fn batch_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": self.model,
                    "content": { "parts": [{ "text": t }] }
                })
            })
            .collect();

        let url = format!(
            "{BASE_URL}/{}:batchEmbedContents?key={}",
            self.model, self.api_key
        );
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("gemini", &e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("gemini", status.as_u16(), &body));
        }

        let parsed: BatchEmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: "gemini",
                message: e.to_string(),
            })?;
        if parsed.embeddings.len() != texts.len() {
            return Err(ProviderError::InvalidResponse {
                provider: "gemini",
                message: format!(
                    "expected {} vectors, got {}",
                    texts.len(),
                    parsed.embeddings.len()
                ),
            });
        }
        Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn embed(&self, text: &str, _sector: Option<Sector>) -> Result<Vec<f32>, ProviderError> {
        let texts = vec![text.to_string()];
        let mut vecs = with_resilience(&self.breaker, RetryPolicy::default(), || {
            self.batch_embed(&texts)
        })
        .await?;
        vecs.pop().ok_or(ProviderError::InvalidResponse {
            provider: "gemini",
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
            self.batch_embed(texts)
        })
        .await
    }
}
