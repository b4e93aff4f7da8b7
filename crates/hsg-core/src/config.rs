//! Engine configuration
//!
//! One immutable, typed snapshot built at startup. Layering order:
//! built-in defaults < `hsg.toml` < `HSG_*` environment variables
//! (`HSG_DB_URL`, `HSG_EMB_KIND`, `HSG_DECAY_RATIO`, ...). Runtime changes go
//! through an explicit rebuild; nothing mutates a live snapshot.

use crate::types::Sector;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

// ============================================================================
// TIER
// ============================================================================

/// Ingestion tier. `smart` additionally stores a compressed copy of the fused
/// mean vector; `hybrid` adds keyword-overlap boosting at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    #[default]
    Hybrid,
    Smart,
}

/// Persistence backend selected from `db_url`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

// ============================================================================
// CONFIG
// ============================================================================

/// Accept either a comma-separated string or a proper list; env vars deliver
/// the former, TOML the latter.
fn string_or_list<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Raw::deserialize(de)? {
        Raw::One(s) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Raw::Many(v) => v,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ========== Persistence ==========
    /// `sqlite://<path>`, `postgres://...`, or empty for the platform default
    /// sqlite file
    pub db_url: String,
    pub pg_schema: String,
    /// Base table name; derived tables are suffixed (`_vectors`, ...)
    pub pg_table: String,

    // ========== Embeddings ==========
    /// Primary provider: synthetic | openai | gemini | ollama | aws
    pub emb_kind: String,
    /// Tried in order after the primary; synthetic is always the last resort
    #[serde(deserialize_with = "string_or_list")]
    pub embedding_fallback: Vec<String>,
    pub vec_dim: usize,
    pub max_vector_dim: usize,
    pub min_vector_dim: usize,

    pub openai_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: Option<String>,
    pub gemini_key: Option<String>,
    pub gemini_embedding_model: Option<String>,
    pub ollama_base_url: String,
    pub ollama_embedding_model: Option<String>,
    pub aws_region: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_embedding_model: Option<String>,

    // ========== HSG ==========
    pub tier: Tier,
    pub seg_size: i64,
    pub use_summary_only: bool,
    pub summary_max_length: usize,
    pub keyword_boost: f64,

    // ========== Decay ==========
    /// Minutes between decay cycles
    pub decay_interval: u64,
    /// Fraction of each segment sampled per cycle
    pub decay_ratio: f64,
    pub decay_cold_threshold: f64,
    pub decay_episodic: f64,
    pub decay_semantic: f64,
    pub decay_procedural: f64,
    pub decay_emotional: f64,
    pub decay_reflective: f64,

    // ========== Reflection ==========
    pub auto_reflect: bool,
    /// Minutes between reflection passes
    pub reflect_interval: u64,
    pub reflect_min: usize,
    pub reflect_limit: usize,

    // ========== Maintenance ==========
    pub maintenance_interval_hours: u64,
    pub stats_retention_days: i64,

    // ========== Scoring ==========
    pub scoring_similarity: f64,
    pub scoring_overlap: f64,
    pub scoring_waypoint: f64,
    pub scoring_recency: f64,
    pub scoring_tag_match: f64,

    // ========== Reinforcement ==========
    pub reinf_salience_boost: f64,
    pub reinf_waypoint_boost: f64,
    pub reinf_max_salience: f64,
    pub reinf_max_waypoint_weight: f64,
    pub reinf_prune_threshold: f64,

    // ========== Security ==========
    pub encryption_enabled: bool,
    pub encryption_key: Option<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub encryption_secondary_keys: Vec<String>,

    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: String::new(),
            pg_schema: "public".into(),
            pg_table: "memories".into(),

            emb_kind: "synthetic".into(),
            embedding_fallback: vec!["synthetic".into()],
            vec_dim: 1536,
            max_vector_dim: 1536,
            min_vector_dim: 64,

            openai_key: None,
            openai_base_url: "https://api.openai.com/v1".into(),
            openai_model: None,
            gemini_key: None,
            gemini_embedding_model: None,
            ollama_base_url: "http://localhost:11434".into(),
            ollama_embedding_model: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_embedding_model: None,

            tier: Tier::Hybrid,
            seg_size: 10_000,
            use_summary_only: true,
            summary_max_length: 200,
            keyword_boost: 2.5,

            decay_interval: 5,
            decay_ratio: 0.03,
            decay_cold_threshold: 0.25,
            decay_episodic: 0.015,
            decay_semantic: 0.005,
            decay_procedural: 0.008,
            decay_emotional: 0.02,
            decay_reflective: 0.001,

            auto_reflect: true,
            reflect_interval: 10,
            reflect_min: 20,
            reflect_limit: 500,

            maintenance_interval_hours: 24,
            stats_retention_days: 30,

            scoring_similarity: 1.0,
            scoring_overlap: 0.5,
            scoring_waypoint: 0.3,
            scoring_recency: 0.2,
            scoring_tag_match: 0.4,

            reinf_salience_boost: 0.1,
            reinf_waypoint_boost: 0.05,
            reinf_max_salience: 1.0,
            reinf_max_waypoint_weight: 1.0,
            reinf_prune_threshold: 0.1,

            encryption_enabled: false,
            encryption_key: None,
            encryption_secondary_keys: vec![],

            verbose: false,
        }
    }
}

impl Config {
    /// Load the layered configuration: defaults < hsg.toml < HSG_* env vars.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("hsg.toml"))
            .merge(Env::prefixed("HSG_"))
            .extract()
    }

    /// Backend implied by `db_url`
    pub fn backend(&self) -> BackendKind {
        if self.db_url.starts_with("postgres://") || self.db_url.starts_with("postgresql://") {
            BackendKind::Postgres
        } else {
            BackendKind::Sqlite
        }
    }

    /// Path of the embedded database file; None means the platform default
    /// data directory. `sqlite:///abs/path` keeps its leading slash.
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        if self.db_url.is_empty() {
            return None;
        }
        let p = self.db_url.strip_prefix("sqlite://").unwrap_or(&self.db_url);
        Some(PathBuf::from(p))
    }

    /// Sector-specific decay rate constant
    pub fn sector_lambda(&self, sector: Sector) -> f64 {
        match sector {
            Sector::Episodic => self.decay_episodic,
            Sector::Semantic => self.decay_semantic,
            Sector::Procedural => self.decay_procedural,
            Sector::Emotional => self.decay_emotional,
            Sector::Reflective => self.decay_reflective,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.tier, Tier::Hybrid);
        assert_eq!(cfg.seg_size, 10_000);
        assert_eq!(cfg.vec_dim, 1536);
        assert!((cfg.sector_lambda(Sector::Reflective) - 0.001).abs() < 1e-9);
        assert_eq!(cfg.backend(), BackendKind::Sqlite);
        assert!(cfg.sqlite_path().is_none());
    }

    #[test]
    fn test_db_url_parsing() {
        let mut cfg = Config::default();
        cfg.db_url = "sqlite:///tmp/mem.db".into();
        assert_eq!(cfg.backend(), BackendKind::Sqlite);
        assert_eq!(cfg.sqlite_path().unwrap(), PathBuf::from("/tmp/mem.db"));

        cfg.db_url = "postgres://localhost/hsg".into();
        assert_eq!(cfg.backend(), BackendKind::Postgres);
    }

    #[test]
    fn test_fallback_list_from_string() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "string_or_list")]
            v: Vec<String>,
        }
        let p: Probe = serde_json::from_str(r#"{"v": "openai, synthetic"}"#).unwrap();
        assert_eq!(p.v, vec!["openai", "synthetic"]);
        let p: Probe = serde_json::from_str(r#"{"v": ["a","b"]}"#).unwrap();
        assert_eq!(p.v, vec!["a", "b"]);
    }
}
