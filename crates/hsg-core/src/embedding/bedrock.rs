//! AWS Bedrock (Titan) embeddings adapter
//!
//! Invokes `POST /model/{id}/invoke` on bedrock-runtime with a minimal
//! SigV4 signer. Only the headers the signature covers are sent:
//! content-type, host, x-amz-date.

use super::resilience::{with_resilience, CircuitBreaker, RetryPolicy};
use super::{EmbeddingProvider, ProviderError};
use crate::config::Config;
use crate::types::Sector;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

const DEFAULT_MODEL: &str = "amazon.titan-embed-text-v1";
const SERVICE: &str = "bedrock";

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize)]
struct TitanResponse {
    embedding: Vec<f32>,
}

pub struct BedrockProvider {
    client: reqwest::Client,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    model: String,
    breaker: CircuitBreaker,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

impl BedrockProvider {
    pub fn from_config(cfg: &Config) -> Option<Self> {
        Some(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            region: cfg.aws_region.clone()?,
            access_key_id: cfg.aws_access_key_id.clone()?,
            secret_access_key: cfg.aws_secret_access_key.clone()?,
            model: cfg
                .aws_embedding_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            breaker: CircuitBreaker::new("aws"),
        })
    }

    /// SigV4 authorization header for a POST to `path` with `body`.
    fn sign(&self, host: &str, path: &str, body: &[u8], amz_date: &str, datestamp: &str) -> String {
        let payload_hash = sha256_hex(body);
        let canonical_headers = format!(
            "content-type:application/json\nhost:{host}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "content-type;host;x-amz-date";
        let canonical_request = format!(
            "POST\n{path}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let scope = format!("{datestamp}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_access_key).as_bytes(),
            datestamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key_id
        )
    }

    async fn invoke(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let host = format!("bedrock-runtime.{}.amazonaws.com", self.region);
        let path = format!("/model/{}/invoke", self.model);
        let body = serde_json::json!({ "inputText": text }).to_string();

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let authorization = self.sign(&host, &path, body.as_bytes(), &amz_date, &datestamp);

        let resp = self
            .client
            .post(format!("https://{host}{path}"))
            .header("content-type", "application/json")
            .header("x-amz-date", amz_date)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("aws", &e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("aws", status.as_u16(), &body));
        }

        let parsed: TitanResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: "aws",
                message: e.to_string(),
            })?;
        if parsed.embedding.is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: "aws",
                message: "empty embedding".into(),
            });
        }
        Ok(parsed.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for BedrockProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn embed(&self, text: &str, _sector: Option<Sector>) -> Result<Vec<f32>, ProviderError> {
        with_resilience(&self.breaker, RetryPolicy::default(), || self.invoke(text)).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_and_sha() {
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
        // SHA-256 of the empty string, a fixed vector
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let cfg = Config {
            aws_region: Some("us-east-1".into()),
            aws_access_key_id: Some("AKIDEXAMPLE".into()),
            aws_secret_access_key: Some("secretsecretsecret".into()),
            ..Default::default()
        };
        let p = BedrockProvider::from_config(&cfg).unwrap();
        let a = p.sign(
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/model/amazon.titan-embed-text-v1/invoke",
            b"{}",
            "20240101T000000Z",
            "20240101",
        );
        let b = p.sign(
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/model/amazon.titan-embed-text-v1/invoke",
            b"{}",
            "20240101T000000Z",
            "20240101",
        );
        assert_eq!(a, b);
        assert!(a.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240101/us-east-1/bedrock/aws4_request"));
    }
}
