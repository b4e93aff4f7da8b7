//! Ollama embeddings adapter
//!
//! `POST {base}/api/embeddings`, one prompt per call. No auth; the host is
//! usually local, so the timeout is the main failure mode.

use super::resilience::{with_resilience, CircuitBreaker, RetryPolicy};
use super::{EmbeddingProvider, ProviderError};
use crate::config::Config;
use crate::types::Sector;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_MODEL: &str = "nomic-embed-text";

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    breaker: CircuitBreaker,
}

impl OllamaProvider {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: cfg.ollama_base_url.trim_end_matches('/').to_string(),
            model: cfg
                .ollama_embedding_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            breaker: CircuitBreaker::new("ollama"),
        }
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("ollama", &e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("ollama", status.as_u16(), &body));
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: "ollama",
                message: e.to_string(),
            })?;
        if parsed.embedding.is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: "ollama",
                message: "empty embedding".into(),
            });
        }
        Ok(parsed.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn embed(&self, text: &str, _sector: Option<Sector>) -> Result<Vec<f32>, ProviderError> {
        with_resilience(&self.breaker, RetryPolicy::default(), || {
            self.embed_one(text)
        })
        .await
    }
}
