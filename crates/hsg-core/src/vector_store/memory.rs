//! In-memory vector store
//!
//! A `(id, sector)` map with full-scan cosine search. No metadata pushdown
//! (there is no row store to join against); callers post-filter. Used for
//! tests and throwaway engines.

use super::{VectorFilters, VectorMatch, VectorStore};
use crate::storage::Result;
use crate::types::VectorRecord;
use crate::vectors::cosine_similarity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryVectorStore {
    inner: RwLock<HashMap<(String, String), VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn store_vector(&self, rec: &VectorRecord) -> Result<()> {
        if let Ok(mut map) = self.inner.write() {
            map.insert((rec.id.clone(), rec.sector.clone()), rec.clone());
        }
        Ok(())
    }

    async fn store_vectors(&self, recs: &[VectorRecord]) -> Result<()> {
        if let Ok(mut map) = self.inner.write() {
            for rec in recs {
                map.insert((rec.id.clone(), rec.sector.clone()), rec.clone());
            }
        }
        Ok(())
    }

    async fn vectors_by_id(&self, id: &str, user_id: Option<&str>) -> Result<Vec<VectorRecord>> {
        let map = self.inner.read().map_err(|_| {
            crate::storage::StorageError::Init("vector map lock poisoned".into())
        })?;
        Ok(map
            .values()
            .filter(|r| r.id == id)
            .filter(|r| user_id.is_none() || r.user_id.as_deref() == user_id)
            .cloned()
            .collect())
    }

    async fn vectors_by_ids(
        &self,
        ids: &[String],
        user_id: Option<&str>,
    ) -> Result<HashMap<String, Vec<VectorRecord>>> {
        let map = self.inner.read().map_err(|_| {
            crate::storage::StorageError::Init("vector map lock poisoned".into())
        })?;
        let mut out: HashMap<String, Vec<VectorRecord>> = HashMap::new();
        for rec in map.values() {
            if ids.contains(&rec.id)
                && (user_id.is_none() || rec.user_id.as_deref() == user_id)
            {
                out.entry(rec.id.clone()).or_default().push(rec.clone());
            }
        }
        Ok(out)
    }

    async fn vector(
        &self,
        id: &str,
        sector: &str,
        user_id: Option<&str>,
    ) -> Result<Option<VectorRecord>> {
        let map = self.inner.read().map_err(|_| {
            crate::storage::StorageError::Init("vector map lock poisoned".into())
        })?;
        Ok(map
            .get(&(id.to_string(), sector.to_string()))
            .filter(|r| user_id.is_none() || r.user_id.as_deref() == user_id)
            .cloned())
    }

    async fn recent_vectors(
        &self,
        sector: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>> {
        // No insertion order is tracked here; return an arbitrary bounded set
        let map = self.inner.read().map_err(|_| {
            crate::storage::StorageError::Init("vector map lock poisoned".into())
        })?;
        Ok(map
            .values()
            .filter(|r| r.sector == sector)
            .filter(|r| user_id.is_none() || r.user_id.as_deref() == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_vectors(&self, id: &str, sector: Option<&str>) -> Result<()> {
        if let Ok(mut map) = self.inner.write() {
            match sector {
                Some(s) => {
                    map.remove(&(id.to_string(), s.to_string()));
                }
                None => {
                    map.retain(|(rid, _), _| rid != id);
                }
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        sector: &str,
        k: usize,
        filters: &VectorFilters,
    ) -> Result<Vec<VectorMatch>> {
        let map = self.inner.read().map_err(|_| {
            crate::storage::StorageError::Init("vector map lock poisoned".into())
        })?;
        let mut scored: Vec<VectorMatch> = map
            .values()
            .filter(|r| r.sector == sector)
            .filter(|r| {
                filters.user_id.is_none() || r.user_id.as_deref() == filters.user_id.as_deref()
            })
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: cosine_similarity(query, &r.vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_scan_search() {
        let s = MemoryVectorStore::new();
        s.store_vectors(&[
            VectorRecord::new("a", "semantic", vec![1.0, 0.0]).with_user("u1"),
            VectorRecord::new("b", "semantic", vec![0.0, 1.0]).with_user("u1"),
        ])
        .await
        .unwrap();
        assert_eq!(s.len(), 2);

        let hits = s
            .search(&[1.0, 0.0], "semantic", 1, &VectorFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn test_delete_all_for_id() {
        let s = MemoryVectorStore::new();
        s.store_vector(&VectorRecord::new("a", "semantic", vec![1.0]))
            .await
            .unwrap();
        s.store_vector(&VectorRecord::new("a", "semantic_cold", vec![1.0]))
            .await
            .unwrap();
        s.delete_vectors("a", None).await.unwrap();
        assert!(s.is_empty());
    }
}
