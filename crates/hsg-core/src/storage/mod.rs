//! Persistence layer
//!
//! A transactional row store behind one async trait with two backends: the
//! embedded SQLite store (default, WAL, single serialized writer) and an
//! external Postgres store (pooled, `?` placeholders rewritten to `$n`).
//! Ownership checks happen in higher layers; every memory-scoped call simply
//! honors an optional user filter.

pub mod migrations;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::types::{
    ClassifierModel, EmbedLog, MaintLog, MemoryRecord, SectorStat, UserProfile, Waypoint,
};
use async_trait::async_trait;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Postgres error
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Postgres(#[from] sqlx::Error),
    /// Row decoded but a column did not have the expected shape
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// TABLE RESOLUTION
// ============================================================================

/// Resolved table names. SQLite uses the plain names; Postgres prefixes the
/// schema and derives secondary tables from the configured base name.
#[derive(Debug, Clone)]
pub struct Tables {
    pub memories: String,
    pub vectors: String,
    pub waypoints: String,
    pub users: String,
    pub stats: String,
    pub embed_logs: String,
    pub learned_models: String,
    pub maint_logs: String,
}

impl Tables {
    pub fn sqlite() -> Self {
        Self {
            memories: "memories".into(),
            vectors: "vectors".into(),
            waypoints: "waypoints".into(),
            users: "users".into(),
            stats: "stats".into(),
            embed_logs: "embed_logs".into(),
            learned_models: "learned_models".into(),
            maint_logs: "maint_logs".into(),
        }
    }

    pub fn postgres(schema: &str, base: &str) -> Self {
        let q = |name: String| format!("\"{schema}\".\"{name}\"");
        Self {
            memories: q(base.to_string()),
            vectors: q(format!("{base}_vectors")),
            waypoints: q(format!("{base}_waypoints")),
            users: q(format!("{base}_users")),
            stats: q(format!("{base}_stats")),
            embed_logs: q(format!("{base}_embed_logs")),
            learned_models: q(format!("{base}_learned_models")),
            maint_logs: q(format!("{base}_maint_logs")),
        }
    }

    /// Rewrite `{m} {v} {w} {u} {s} {el} {lm} {ml}` placeholders in a SQL
    /// script or statement.
    pub fn resolve(&self, sql: &str) -> String {
        sql.replace("{m}", &self.memories)
            .replace("{v}", &self.vectors)
            .replace("{w}", &self.waypoints)
            .replace("{u}", &self.users)
            .replace("{s}", &self.stats)
            .replace("{el}", &self.embed_logs)
            .replace("{lm}", &self.learned_models)
            .replace("{ml}", &self.maint_logs)
    }
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// The persistence contract. Composite operations (`delete_memory`,
/// `delete_orphans`, `rewrite_contents`) are internally transactional; for
/// multi-call sequences the engine brackets work with `begin`/`commit` while
/// holding its write gate, so transactions never interleave.
#[async_trait]
pub trait Storage: Send + Sync {
    fn backend(&self) -> &'static str;

    // ========== Transactions ==========
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    // ========== Memories ==========
    async fn upsert_memory(&self, rec: &MemoryRecord) -> Result<()>;
    /// Update seen-markers: last_seen_at, salience, updated_at
    async fn touch_memory(
        &self,
        id: &str,
        last_seen: i64,
        salience: f64,
        updated: i64,
        user_id: Option<&str>,
    ) -> Result<()>;
    async fn update_memory_content(
        &self,
        id: &str,
        content: &str,
        sector: crate::types::Sector,
        tags: &str,
        metadata: &str,
        updated: i64,
        user_id: Option<&str>,
    ) -> Result<()>;
    async fn update_feedback(&self, id: &str, score: f64, user_id: Option<&str>) -> Result<()>;
    /// Batched salience updates: `(salience, updated_at, id)` triples
    async fn update_salience_batch(&self, rows: &[(f64, i64, String)]) -> Result<()>;
    async fn set_generated_summary(&self, id: &str, summary: &str) -> Result<()>;
    /// Merge `consolidated=true` into the metadata of each row
    async fn mark_consolidated(&self, ids: &[String], updated: i64) -> Result<()>;
    /// Multiply salience by `factor`, capped at 1.0
    async fn scale_salience(&self, ids: &[String], factor: f64, updated: i64) -> Result<()>;

    async fn memory(&self, id: &str, user_id: Option<&str>) -> Result<Option<MemoryRecord>>;
    /// Strongest-salience row with this exact fingerprint
    async fn memory_by_simhash(
        &self,
        simhash: &str,
        user_id: Option<&str>,
    ) -> Result<Option<MemoryRecord>>;
    async fn memories_by_ids(
        &self,
        ids: &[String],
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>>;
    /// Most recent first
    async fn recent_memories(
        &self,
        limit: i64,
        offset: i64,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>>;
    async fn memories_by_sector(
        &self,
        sector: crate::types::Sector,
        limit: i64,
        offset: i64,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>>;
    /// Distinct user ids with at least one memory
    async fn list_users(&self) -> Result<Vec<String>>;

    // ========== Segments ==========
    async fn segments(&self) -> Result<Vec<i64>>;
    async fn max_segment(&self, user_id: Option<&str>) -> Result<i64>;
    async fn segment_count(&self, segment: i64, user_id: Option<&str>) -> Result<i64>;
    async fn memories_in_segment(&self, segment: i64) -> Result<Vec<MemoryRecord>>;

    // ========== Deletion ==========
    /// Cascade delete: vectors, waypoints touching the id, then the row.
    /// One transaction; returns false when the row did not exist.
    async fn delete_memory(&self, id: &str, user_id: Option<&str>) -> Result<bool>;
    /// Cascade delete of every memory owned by the user; returns rows removed
    async fn delete_user_memories(&self, user_id: &str) -> Result<u64>;

    // ========== Waypoints ==========
    async fn upsert_waypoint(&self, wp: &Waypoint) -> Result<()>;
    async fn waypoint(&self, src: &str, dst: &str) -> Result<Option<Waypoint>>;
    /// Outgoing edges for a batch of sources, strongest first
    async fn neighbors(&self, src_ids: &[String], user_id: Option<&str>) -> Result<Vec<Waypoint>>;
    /// Bump each consecutive edge of a retrieval path by `boost`, capped
    async fn bump_waypoints(
        &self,
        path: &[String],
        boost: f64,
        cap: f64,
        user_id: &str,
        now: i64,
    ) -> Result<()>;
    async fn prune_waypoints(&self, threshold: f64) -> Result<u64>;

    /// Remove vectors and waypoints whose memory no longer exists.
    /// One transaction; returns (vectors_removed, waypoints_removed).
    async fn delete_orphans(&self) -> Result<(u64, u64)>;

    // ========== Classifier ==========
    async fn classifier_model(&self, user_id: &str) -> Result<Option<ClassifierModel>>;
    async fn put_classifier_model(&self, user_id: &str, model: &ClassifierModel) -> Result<()>;
    /// `(mean_vec, primary_sector)` training pairs for a user
    async fn training_data(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<(Vec<f32>, crate::types::Sector)>>;

    // ========== Logs & stats ==========
    async fn insert_embed_log(&self, log: &EmbedLog) -> Result<()>;
    async fn update_embed_log(
        &self,
        id: &str,
        status: crate::types::EmbedStatus,
        err: Option<&str>,
    ) -> Result<()>;
    /// Embed-log rows in a given state, newest first (observability surface)
    async fn embed_logs_by_status(
        &self,
        status: crate::types::EmbedStatus,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<EmbedLog>>;
    async fn append_stat(&self, kind: &str, count: i64, ts: i64) -> Result<()>;
    async fn sector_stats(&self, user_id: Option<&str>) -> Result<Vec<SectorStat>>;
    async fn delete_stats_before(&self, ts: i64) -> Result<u64>;
    async fn append_maint_log(&self, log: &MaintLog) -> Result<()>;

    // ========== Users ==========
    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
    async fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()>;
    async fn update_user_summary(&self, user_id: &str, summary: &str, updated: i64) -> Result<()>;
    async fn bump_reflection_count(&self, user_id: &str) -> Result<()>;

    // ========== Maintenance ==========
    /// Rewrite content columns in one transaction (key rotation)
    async fn rewrite_contents(&self, rows: &[(String, String)]) -> Result<()>;
    /// VACUUM on sqlite, ANALYZE on postgres
    async fn optimize(&self) -> Result<()>;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_resolve_sqlite() {
        let t = Tables::sqlite();
        let sql = t.resolve("SELECT * FROM {m} JOIN {v} ON {v}.id = {m}.id");
        assert_eq!(sql, "SELECT * FROM memories JOIN vectors ON vectors.id = memories.id");
    }

    #[test]
    fn test_tables_resolve_postgres() {
        let t = Tables::postgres("public", "mem");
        assert_eq!(t.resolve("{m}"), "\"public\".\"mem\"");
        assert_eq!(t.resolve("{v}"), "\"public\".\"mem_vectors\"");
        assert_eq!(t.resolve("{lm}"), "\"public\".\"mem_learned_models\"");
    }
}
