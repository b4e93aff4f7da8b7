//! Synthetic embeddings
//!
//! Deterministic hash-feature vectors: no model, no network, no download.
//! Unigrams (tf-idf weighted), character 3/4-grams, bigrams, trigrams,
//! skip-bigrams, sinusoidal positional features, and length/density buckets
//! are hashed into a fixed-dimension vector and L2-normalized. The sector
//! hint salts every feature key, so the same text embeds differently per
//! sector, which is what multi-sector retrieval needs.
//!
//! This is the mandatory last rung of the failover chain; it must never fail.

use super::{ChatMessage, EmbeddingProvider, ProviderError};
use crate::text::canonical_tokens;
use crate::types::Sector;
use crate::vectors::l2_normalize;
use async_trait::async_trait;
use std::collections::HashMap;

const MURMUR_SEED: u32 = 0xdead_beef;

/// Deterministic feature-hash embedder of configurable dimension.
pub struct SyntheticProvider {
    dim: usize,
}

impl SyntheticProvider {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn dimensions(&self) -> usize {
        self.dim
    }

    fn fnv1a(v: &str) -> u32 {
        let mut h: u32 = 0x811c_9dc5;
        for b in v.bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(16_777_619);
        }
        h
    }

    fn murmurish(v: &str, seed: u32) -> u32 {
        let mut h = seed;
        for b in v.bytes() {
            h = (h ^ b as u32).wrapping_mul(0x5bd1_e995);
            h = (h >> 13) ^ h;
        }
        h
    }

    fn add_feature(&self, vec: &mut [f32], key: &str, weight: f32) {
        let h = Self::fnv1a(key);
        let h2 = Self::murmurish(key, MURMUR_SEED);
        // Sign comes from the low bit so features cancel rather than pile up
        let val = weight * (1.0 - ((h & 1) << 1) as f32);

        let dim = self.dim as u32;
        if self.dim.is_power_of_two() {
            vec[(h & (dim - 1)) as usize] += val;
            vec[(h2 & (dim - 1)) as usize] += val * 0.5;
        } else {
            vec[(h % dim) as usize] += val;
            vec[(h2 % dim) as usize] += val * 0.5;
        }
    }

    fn add_positional(&self, vec: &mut [f32], pos: usize, weight: f32) {
        let idx = pos % self.dim;
        let ang = pos as f64 / 10_000f64.powf((2 * idx) as f64 / self.dim as f64);
        vec[idx] += weight * ang.sin() as f32;
        vec[(idx + 1) % self.dim] += weight * ang.cos() as f32;
    }

    /// Generate the embedding for `(text, sector)`.
    pub fn generate(&self, text: &str, sector: Sector) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        let tokens = canonical_tokens(text);

        if tokens.is_empty() {
            let x = 1.0 / (self.dim as f32).sqrt();
            return vec![x; self.dim];
        }

        let s = sector.as_str();
        let sw = sector.weight();
        let n = tokens.len();
        let density_log = (1.0 + n as f32).ln();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for tok in &tokens {
            *counts.entry(tok.as_str()).or_insert(0) += 1;
        }

        // Unigrams with tf-idf weighting, plus char n-grams per token
        for (tok, c) in &counts {
            let tf = *c as f32 / n as f32;
            let idf = (1.0 + n as f32 / *c as f32).ln();
            let w = (tf * idf + 1.0) * sw;
            self.add_feature(&mut v, &format!("{s}|tok|{tok}"), w);
            let bytes = tok.as_bytes();
            if bytes.len() >= 3 {
                for i in 0..=bytes.len() - 3 {
                    self.add_feature(&mut v, &format!("{s}|c3|{}", &tok[i..i + 3]), w * 0.4);
                }
            }
            if bytes.len() >= 4 {
                for i in 0..=bytes.len() - 4 {
                    self.add_feature(&mut v, &format!("{s}|c4|{}", &tok[i..i + 4]), w * 0.3);
                }
            }
        }

        // Bigrams, position-discounted
        for i in 0..n.saturating_sub(1) {
            let pw = 1.0 / (1.0 + i as f32 * 0.1);
            self.add_feature(
                &mut v,
                &format!("{s}|bi|{}_{}", tokens[i], tokens[i + 1]),
                1.4 * sw * pw,
            );
        }

        // Trigrams
        for i in 0..n.saturating_sub(2) {
            self.add_feature(
                &mut v,
                &format!("{s}|tri|{}_{}_{}", tokens[i], tokens[i + 1], tokens[i + 2]),
                1.0 * sw,
            );
        }

        // Skip-bigrams over the head of the text
        for i in 0..n.saturating_sub(2).min(20) {
            self.add_feature(
                &mut v,
                &format!("{s}|skip|{}_{}", tokens[i], tokens[i + 2]),
                0.7 * sw,
            );
        }

        // Positional encoding for the first 50 tokens
        for i in 0..n.min(50) {
            self.add_positional(&mut v, i, (0.5 * sw) / density_log);
        }

        // Length bucket
        let lb = ((n as f32 + 1.0).log2().floor() as u32).min(10);
        self.add_feature(&mut v, &format!("{s}|len|{lb}"), 0.6 * sw);

        // Density bucket (distinct/total)
        let density = counts.len() as f32 / n as f32;
        let db = (density * 10.0).floor() as u32;
        self.add_feature(&mut v, &format!("{s}|dens|{db}"), 0.5 * sw);

        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for SyntheticProvider {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn embed(&self, text: &str, sector: Option<Sector>) -> Result<Vec<f32>, ProviderError> {
        Ok(self.generate(text, sector.unwrap_or_default()))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        sector: Option<Sector>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let sector = sector.unwrap_or_default();
        Ok(texts.iter().map(|t| self.generate(t, sector)).collect())
    }

    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String, ProviderError> {
        Ok("Synthetic response.".to_string())
    }

    async fn chat_json(&self, _prompt: &str) -> Result<serde_json::Value, ProviderError> {
        Ok(serde_json::json!({}))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vectors::cosine_similarity;

    #[test]
    fn test_deterministic() {
        let p = SyntheticProvider::new(256);
        let a = p.generate("the cat sat on the mat", Sector::Semantic);
        let b = p.generate("the cat sat on the mat", Sector::Semantic);
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
    }

    #[test]
    fn test_sector_salt_changes_vector() {
        let p = SyntheticProvider::new(256);
        let a = p.generate("how to build a shed", Sector::Semantic);
        let b = p.generate("how to build a shed", Sector::Procedural);
        assert!(cosine_similarity(&a, &b) < 0.999);
    }

    #[test]
    fn test_similar_texts_are_closer() {
        let p = SyntheticProvider::new(512);
        let base = p.generate("paris travel trip eiffel tower vacation", Sector::Semantic);
        let near = p.generate("paris travel trip eiffel tower visit", Sector::Semantic);
        let far = p.generate("database index compaction strategy", Sector::Semantic);
        assert!(
            cosine_similarity(&base, &near) > cosine_similarity(&base, &far),
            "lexically similar text should embed closer"
        );
    }

    #[test]
    fn test_empty_text_uniform() {
        let p = SyntheticProvider::new(64);
        let v = p.generate("", Sector::Semantic);
        assert_eq!(v.len(), 64);
        let expected = 1.0 / 8.0;
        assert!(v.iter().all(|x| (*x - expected).abs() < 1e-6));
    }

    #[test]
    fn test_normalized() {
        let p = SyntheticProvider::new(128);
        let v = p.generate("some text to embed", Sector::Emotional);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
