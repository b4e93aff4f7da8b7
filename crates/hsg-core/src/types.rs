//! Core data model
//!
//! Row structs mirror the persisted tables one-to-one; `MemoryItem` is the
//! decrypted API view handed to callers, optionally enriched with a score,
//! a retrieval trace, and a waypoint path.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// SECTORS
// ============================================================================

/// The five cognitive sectors a memory can be classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sector {
    /// Events and experiences ("went", "yesterday", "that time")
    Episodic,
    /// Facts and concepts (the default when nothing else matches)
    #[default]
    Semantic,
    /// How-to knowledge and step sequences
    Procedural,
    /// Feelings, moods, affective language
    Emotional,
    /// Insights, patterns, conclusions (also the sector of synthesized reflections)
    Reflective,
}

impl Sector {
    /// All sectors, in matrix order
    pub const ALL: [Sector; 5] = [
        Sector::Episodic,
        Sector::Semantic,
        Sector::Procedural,
        Sector::Emotional,
        Sector::Reflective,
    ];

    /// Stable string form used in rows and vector keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Sector::Episodic => "episodic",
            Sector::Semantic => "semantic",
            Sector::Procedural => "procedural",
            Sector::Emotional => "emotional",
            Sector::Reflective => "reflective",
        }
    }

    /// Parse from the stored string form. Unknown strings fall back to semantic.
    pub fn parse_name(s: &str) -> Self {
        match s {
            "episodic" => Sector::Episodic,
            "procedural" => Sector::Procedural,
            "emotional" => Sector::Emotional,
            "reflective" => Sector::Reflective,
            _ => Sector::Semantic,
        }
    }

    /// Index into the 5x5 resonance matrix
    pub fn matrix_index(&self) -> usize {
        match self {
            Sector::Episodic => 0,
            Sector::Semantic => 1,
            Sector::Procedural => 2,
            Sector::Emotional => 3,
            Sector::Reflective => 4,
        }
    }

    /// Relative embedding weight of this sector in the fused mean vector
    pub fn weight(&self) -> f32 {
        match self {
            Sector::Episodic => 1.2,
            Sector::Semantic => 1.0,
            Sector::Procedural => 1.1,
            Sector::Emotional => 0.9,
            Sector::Reflective => 1.3,
        }
    }

    /// Key of the cold-store bucket for this sector
    pub fn cold_key(&self) -> String {
        format!("{}_cold", self.as_str())
    }
}

impl std::fmt::Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY ROWS
// ============================================================================

/// A memory row as persisted. `content` holds the encryption envelope when
/// encryption is enabled; use the engine API for the decrypted view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    /// Growth-partitioning bucket, rotated when a segment fills up
    pub segment: i64,
    pub content: String,
    /// 16-hex simhash fingerprint for near-duplicate detection
    pub simhash: String,
    pub primary_sector: Sector,
    /// JSON array of tags as stored
    pub tags: String,
    /// JSON object of metadata as stored (may carry `additional_sectors`)
    pub metadata: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_seen_at: i64,
    pub salience: f64,
    pub decay_lambda: f64,
    pub version: i64,
    pub mean_dim: Option<i64>,
    /// Fused cross-sector vector, packed little-endian f32
    pub mean_vec: Option<Vec<u8>>,
    /// Low-dim copy written in tier=smart; not consulted by retrieval
    pub compressed_vec: Option<Vec<u8>>,
    /// EMA of retrieval scores
    pub feedback_score: f64,
    /// Cold-store keyword placeholder once heavily decayed
    pub generated_summary: Option<String>,
}

impl MemoryRecord {
    /// Decode the stored tags JSON, tolerating malformed rows
    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }

    /// Decode the stored metadata JSON, tolerating malformed rows
    pub fn metadata_map(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }

    /// Sectors beyond the primary, as recorded in metadata
    pub fn additional_sectors(&self) -> Vec<Sector> {
        self.metadata_map()
            .get("additional_sectors")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str())
                    .map(Sector::parse_name)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True once reflection has folded this memory into a synthesized one
    pub fn is_consolidated(&self) -> bool {
        self.metadata_map()
            .get("consolidated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Dense vector row, keyed by `(id, sector)`. The sector key is a plain
/// string because cold copies live under `<sector>_cold`.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub sector: String,
    pub user_id: Option<String>,
    pub vector: Vec<f32>,
    pub dim: usize,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>, sector: impl Into<String>, vector: Vec<f32>) -> Self {
        let dim = vector.len();
        Self {
            id: id.into(),
            sector: sector.into(),
            user_id: None,
            vector,
            dim,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Directed weighted edge between two memories of the same user.
/// Self-loops are allowed (the first memory of a user links to itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub src_id: String,
    pub dst_id: String,
    pub user_id: String,
    pub weight: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-user profile row with a rolling natural-language summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub summary: String,
    pub reflection_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub metadata: Option<String>,
}

/// Per-user learned linear classifier: one weight vector and bias per sector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub weights: HashMap<String, Vec<f32>>,
    pub biases: HashMap<String, f32>,
    pub version: i64,
    pub updated_at: i64,
}

/// Embed-log lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedStatus {
    Pending,
    Completed,
    Failed,
}

impl EmbedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedStatus::Pending => "pending",
            EmbedStatus::Completed => "completed",
            EmbedStatus::Failed => "failed",
        }
    }
}

/// Observability row for one (possibly multi-sector) embedding operation.
#[derive(Debug, Clone)]
pub struct EmbedLog {
    pub id: String,
    pub model: String,
    pub status: EmbedStatus,
    pub ts: i64,
    pub err: Option<String>,
    pub user_id: Option<String>,
}

/// Structured record of one maintenance step (decay, reflect, retrain, ...).
#[derive(Debug, Clone)]
pub struct MaintLog {
    pub id: String,
    pub op: String,
    pub status: String,
    pub ts: i64,
    pub details: String,
}

/// Per-sector aggregate used by `Engine::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SectorStat {
    pub sector: String,
    pub count: i64,
    pub avg_salience: f64,
}

// ============================================================================
// API VIEW TYPES
// ============================================================================

/// Metric breakdown captured while scoring one candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    /// Penalized best similarity across sector hits and fusion
    pub sim_adj: f64,
    /// Canonical-token overlap with the query
    pub tok_ov: f64,
    /// Exponential recency score on last_seen_at
    pub recency: f64,
    /// Waypoint weight from graph expansion (0 when reached directly)
    pub waypoint: f64,
    /// Tag-match score against the query token set
    pub tag: f64,
    /// Cross-sector penalty applied (1.0 = none)
    pub penalty: f64,
}

/// Why a memory was recalled: a readable justification plus raw metrics and
/// the waypoint path that reached it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub justification: String,
    pub metrics: ScoreBreakdown,
    pub path: Vec<String>,
}

/// Decrypted memory as returned by the engine API.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryItem {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub primary_sector: Sector,
    pub sectors: Vec<Sector>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_seen_at: i64,
    pub salience: f64,
    pub decay_lambda: f64,
    pub version: i64,
    pub segment: i64,
    pub simhash: String,
    pub feedback_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_summary: Option<String>,
    /// Hybrid retrieval score (z-normalized within the result set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
    /// Raw metric map, present only when the query asked for debug output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<ScoreBreakdown>,
}

impl MemoryItem {
    /// Build the API view from a row and its already-decrypted content.
    pub fn from_record(rec: &MemoryRecord, content: String) -> Self {
        let mut sectors = vec![rec.primary_sector];
        for s in rec.additional_sectors() {
            if !sectors.contains(&s) {
                sectors.push(s);
            }
        }
        Self {
            id: rec.id.clone(),
            user_id: rec.user_id.clone(),
            content,
            primary_sector: rec.primary_sector,
            sectors,
            tags: rec.tag_list(),
            metadata: rec.metadata_map(),
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            last_seen_at: rec.last_seen_at,
            salience: rec.salience,
            decay_lambda: rec.decay_lambda,
            version: rec.version,
            segment: rec.segment,
            simhash: rec.simhash.clone(),
            feedback_score: rec.feedback_score,
            generated_summary: rec.generated_summary.clone(),
            score: None,
            trace: None,
            debug: None,
        }
    }

    /// Waypoint path that reached this item, when trace-enriched
    pub fn path(&self) -> &[String] {
        self.trace.as_ref().map(|t| t.path.as_slice()).unwrap_or(&[])
    }
}

// ============================================================================
// INPUT / OUTPUT TYPES
// ============================================================================

/// One entry of a batch ingest call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestRequest {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl IngestRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tags: vec![],
            metadata: serde_json::Map::new(),
        }
    }
}

/// Result of an ingest call. Deduplication is a normal outcome, not an error:
/// the second write of near-identical content lands on the existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum IngestOutcome {
    /// A new memory row was created
    Stored {
        id: String,
        primary_sector: Sector,
        sectors: Vec<Sector>,
        salience: f64,
        created_at: i64,
        simhash: String,
        chunks: usize,
    },
    /// Near-duplicate detected; the existing row was reinforced instead
    Deduplicated {
        id: String,
        primary_sector: Sector,
        salience: f64,
        created_at: i64,
    },
}

impl IngestOutcome {
    pub fn id(&self) -> &str {
        match self {
            IngestOutcome::Stored { id, .. } => id,
            IngestOutcome::Deduplicated { id, .. } => id,
        }
    }

    pub fn deduplicated(&self) -> bool {
        matches!(self, IngestOutcome::Deduplicated { .. })
    }

    pub fn primary_sector(&self) -> Sector {
        match self {
            IngestOutcome::Stored { primary_sector, .. } => *primary_sector,
            IngestOutcome::Deduplicated { primary_sector, .. } => *primary_sector,
        }
    }
}

/// Filters accepted by `Engine::search`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    /// Restrict candidate generation to these sectors (default: all five)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sectors: Option<Vec<Sector>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_salience: Option<f64>,
    /// Inclusive created_at lower bound, ms epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Inclusive created_at upper bound, ms epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Metadata equality predicates pushed down to the vector store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Attach the raw metric breakdown to each result
    #[serde(default)]
    pub debug: bool,
}

impl SearchFilters {
    /// Canonical serialization used as part of the query cache key.
    /// serde_json preserves map insertion order, so the fixed field order
    /// here keeps equal filters producing equal keys.
    pub fn cache_key_part(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn has_post_filters(&self) -> bool {
        self.start_time.is_some() || self.end_time.is_some() || self.min_salience.is_some()
    }
}

/// Current ms-epoch timestamp, the clock used across the engine.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_roundtrip() {
        for sector in Sector::ALL {
            assert_eq!(Sector::parse_name(sector.as_str()), sector);
        }
        assert_eq!(Sector::parse_name("garbage"), Sector::Semantic);
    }

    #[test]
    fn test_sector_matrix_indices_unique() {
        let mut seen = [false; 5];
        for sector in Sector::ALL {
            let i = sector.matrix_index();
            assert!(!seen[i]);
            seen[i] = true;
        }
    }

    #[test]
    fn test_additional_sectors_from_metadata() {
        let rec = MemoryRecord {
            id: "m1".into(),
            user_id: "u1".into(),
            segment: 0,
            content: "x".into(),
            simhash: "0".repeat(16),
            primary_sector: Sector::Episodic,
            tags: "[]".into(),
            metadata: r#"{"additional_sectors":["emotional","semantic"]}"#.into(),
            created_at: 0,
            updated_at: 0,
            last_seen_at: 0,
            salience: 0.5,
            decay_lambda: 0.02,
            version: 1,
            mean_dim: None,
            mean_vec: None,
            compressed_vec: None,
            feedback_score: 0.0,
            generated_summary: None,
        };
        assert_eq!(
            rec.additional_sectors(),
            vec![Sector::Emotional, Sector::Semantic]
        );
        assert!(!rec.is_consolidated());

        let item = MemoryItem::from_record(&rec, "x".into());
        assert_eq!(item.sectors.len(), 3);
        assert_eq!(item.sectors[0], Sector::Episodic);
    }

    #[test]
    fn test_ingest_outcome_accessors() {
        let stored = IngestOutcome::Stored {
            id: "a".into(),
            primary_sector: Sector::Semantic,
            sectors: vec![Sector::Semantic],
            salience: 0.4,
            created_at: 1,
            simhash: "f".repeat(16),
            chunks: 1,
        };
        assert!(!stored.deduplicated());
        assert_eq!(stored.id(), "a");

        let dedup = IngestOutcome::Deduplicated {
            id: "a".into(),
            primary_sector: Sector::Semantic,
            salience: 0.55,
            created_at: 1,
        };
        assert!(dedup.deduplicated());
    }

    #[test]
    fn test_ingest_request_deny_unknown_fields() {
        let ok = r#"{"content": "test", "tags": []}"#;
        assert!(serde_json::from_str::<IngestRequest>(ok).is_ok());

        let bad = r#"{"content": "test", "nope": 1}"#;
        assert!(serde_json::from_str::<IngestRequest>(bad).is_err());
    }

    #[test]
    fn test_filter_cache_key_stable() {
        let f1 = SearchFilters {
            user_id: Some("u1".into()),
            min_salience: Some(0.2),
            ..Default::default()
        };
        let f2 = f1.clone();
        assert_eq!(f1.cache_key_part(), f2.cache_key_part());
        assert!(f1.has_post_filters());
        assert!(!SearchFilters::default().has_post_filters());
    }
}
