//! Vector store
//!
//! Abstract store of `(memory_id, sector) -> vector` with cosine search.
//! Three implementations: the embedded SQLite scan over packed f32 blobs,
//! the Postgres/pgvector native index, and an in-memory map for tests and
//! ephemeral engines. All of them saturate gracefully: fewer than `k`
//! results is normal, never an error.

pub mod memory;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::storage::Result;
use crate::types::VectorRecord;
use async_trait::async_trait;
use std::collections::HashMap;

/// Search-time filters pushed down to the store. Metadata predicates are
/// substring matches against the owning memory row's metadata JSON.
#[derive(Debug, Clone, Default)]
pub struct VectorFilters {
    pub user_id: Option<String>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// One search hit: memory id and cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
}

/// The vector store contract.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert one vector by `(id, sector)`
    async fn store_vector(&self, rec: &VectorRecord) -> Result<()>;

    /// Idempotent bulk upsert
    async fn store_vectors(&self, recs: &[VectorRecord]) -> Result<()>;

    /// All sector vectors of one memory
    async fn vectors_by_id(&self, id: &str, user_id: Option<&str>) -> Result<Vec<VectorRecord>>;

    /// Sector vectors for a batch of memories, grouped by id
    async fn vectors_by_ids(
        &self,
        ids: &[String],
        user_id: Option<&str>,
    ) -> Result<HashMap<String, Vec<VectorRecord>>>;

    /// One `(id, sector)` vector
    async fn vector(
        &self,
        id: &str,
        sector: &str,
        user_id: Option<&str>,
    ) -> Result<Option<VectorRecord>>;

    /// Most recently written vectors of a sector, used by the ingest-time
    /// inter-memory linker. Order is newest-first, best-effort per backend.
    async fn recent_vectors(
        &self,
        sector: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>>;

    /// Delete one sector's vector, or every vector of the memory
    async fn delete_vectors(&self, id: &str, sector: Option<&str>) -> Result<()>;

    /// Top-k by cosine similarity within a sector. May return fewer than `k`.
    async fn search(
        &self,
        query: &[f32],
        sector: &str,
        k: usize,
        filters: &VectorFilters,
    ) -> Result<Vec<VectorMatch>>;

    /// Idempotent teardown
    async fn disconnect(&self) -> Result<()>;
}
