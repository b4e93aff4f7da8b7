//! Embedded vector store
//!
//! Shares the SQLite handle with the row store. Vectors live as contiguous
//! f32 blobs; search is a single-pass batched cosine over the sector's rows,
//! exact rather than approximate, which is the right trade at embedded scale.

use super::{VectorFilters, VectorMatch, VectorStore};
use crate::storage::sqlite::SqliteHandle;
use crate::storage::Result;
use crate::types::VectorRecord;
use crate::vectors::{bytes_to_vec, cosine_similarity, vec_to_bytes};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;

pub struct SqliteVectorStore {
    handle: Arc<SqliteHandle>,
}

impl SqliteVectorStore {
    pub fn new(handle: Arc<SqliteHandle>) -> Self {
        Self { handle }
    }
}

fn in_placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

fn row_to_record(r: &rusqlite::Row) -> rusqlite::Result<(String, String, Option<String>, Vec<u8>, i64)> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn decode(id: String, sector: String, user_id: Option<String>, blob: Vec<u8>) -> Option<VectorRecord> {
    let vector = bytes_to_vec(&blob)?;
    let dim = vector.len();
    Some(VectorRecord {
        id,
        sector,
        user_id,
        vector,
        dim,
    })
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn store_vector(&self, rec: &VectorRecord) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (id, sector, user_id, v, dim) VALUES (?,?,?,?,?)",
            self.handle.tables.vectors
        );
        self.handle.write_conn()?.execute(
            &sql,
            params![
                rec.id,
                rec.sector,
                rec.user_id,
                vec_to_bytes(&rec.vector),
                rec.dim as i64
            ],
        )?;
        Ok(())
    }

    async fn store_vectors(&self, recs: &[VectorRecord]) -> Result<()> {
        if recs.is_empty() {
            return Ok(());
        }
        let conn = self.handle.write_conn()?;
        let sql = format!(
            "INSERT OR REPLACE INTO {} (id, sector, user_id, v, dim) VALUES (?,?,?,?,?)",
            self.handle.tables.vectors
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        for rec in recs {
            stmt.execute(params![
                rec.id,
                rec.sector,
                rec.user_id,
                vec_to_bytes(&rec.vector),
                rec.dim as i64
            ])?;
        }
        Ok(())
    }

    async fn vectors_by_id(&self, id: &str, user_id: Option<&str>) -> Result<Vec<VectorRecord>> {
        let conn = self.handle.read_conn()?;
        let mut sql = format!(
            "SELECT id, sector, user_id, v, dim FROM {} WHERE id=?",
            self.handle.tables.vectors
        );
        let mut values: Vec<rusqlite::types::Value> = vec![id.to_string().into()];
        if let Some(u) = user_id {
            sql.push_str(" AND user_id=?");
            values.push(u.to_string().into());
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, sector, user, blob, _)| decode(id, sector, user, blob))
            .collect())
    }

    async fn vectors_by_ids(
        &self,
        ids: &[String],
        user_id: Option<&str>,
    ) -> Result<HashMap<String, Vec<VectorRecord>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.handle.read_conn()?;
        let mut sql = format!(
            "SELECT id, sector, user_id, v, dim FROM {} WHERE id IN ({})",
            self.handle.tables.vectors,
            in_placeholders(ids.len())
        );
        let mut values: Vec<rusqlite::types::Value> = ids
            .iter()
            .map(|id| rusqlite::types::Value::from(id.clone()))
            .collect();
        if let Some(u) = user_id {
            sql.push_str(" AND user_id=?");
            values.push(u.to_string().into());
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out: HashMap<String, Vec<VectorRecord>> = HashMap::new();
        for (id, sector, user, blob, _) in rows {
            if let Some(rec) = decode(id.clone(), sector, user, blob) {
                out.entry(id).or_default().push(rec);
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
        let conn = self.handle.read_conn()?;
        let mut sql = format!(
            "SELECT id, sector, user_id, v, dim FROM {} WHERE id=? AND sector=?",
            self.handle.tables.vectors
        );
        let mut values: Vec<rusqlite::types::Value> =
            vec![id.to_string().into(), sector.to_string().into()];
        if let Some(u) = user_id {
            sql.push_str(" AND user_id=?");
            values.push(u.to_string().into());
        }
        let row = conn
            .query_row(&sql, params_from_iter(values), row_to_record)
            .optional()?;
        Ok(row.and_then(|(id, sector, user, blob, _)| decode(id, sector, user, blob)))
    }

    async fn recent_vectors(
        &self,
        sector: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>> {
        let conn = self.handle.read_conn()?;
        let mut sql = format!(
            "SELECT id, sector, user_id, v, dim FROM {} WHERE sector=?",
            self.handle.tables.vectors
        );
        let mut values: Vec<rusqlite::types::Value> = vec![sector.to_string().into()];
        if let Some(u) = user_id {
            sql.push_str(" AND user_id=?");
            values.push(u.to_string().into());
        }
        sql.push_str(" ORDER BY rowid DESC LIMIT ?");
        values.push((limit as i64).into());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, sector, user, blob, _)| decode(id, sector, user, blob))
            .collect())
    }

    async fn delete_vectors(&self, id: &str, sector: Option<&str>) -> Result<()> {
        let conn = self.handle.write_conn()?;
        match sector {
            Some(s) => {
                let sql = format!(
                    "DELETE FROM {} WHERE id=? AND sector=?",
                    self.handle.tables.vectors
                );
                conn.execute(&sql, params![id, s])?;
            }
            None => {
                let sql = format!("DELETE FROM {} WHERE id=?", self.handle.tables.vectors);
                conn.execute(&sql, params![id])?;
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
        let conn = self.handle.read_conn()?;
        let t = &self.handle.tables;

        let has_meta = filters
            .metadata
            .as_ref()
            .map(|m| !m.is_empty())
            .unwrap_or(false);

        let mut sql = if has_meta {
            format!(
                "SELECT v.id, v.v FROM {} v JOIN {} m ON m.id = v.id WHERE v.sector=?",
                t.vectors, t.memories
            )
        } else {
            format!("SELECT id, v FROM {} WHERE sector=?", t.vectors)
        };
        let mut values: Vec<rusqlite::types::Value> = vec![sector.to_string().into()];

        if let Some(u) = &filters.user_id {
            let col = if has_meta { "v.user_id" } else { "user_id" };
            sql.push_str(&format!(" AND {col}=?"));
            values.push(u.clone().into());
        }
        if has_meta {
            for (key, val) in filters.metadata.as_ref().into_iter().flatten() {
                if val.is_null() {
                    continue;
                }
                let needle = match val.as_str() {
                    Some(s) => s.to_string(),
                    None => val.to_string(),
                };
                sql.push_str(" AND m.metadata LIKE ?");
                values.push(format!("%{key}%{needle}%").into());
            }
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut scored: Vec<VectorMatch> = rows
            .into_iter()
            .filter_map(|(id, blob)| {
                bytes_to_vec(&blob).map(|v| VectorMatch {
                    id,
                    score: cosine_similarity(query, &v),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn disconnect(&self) -> Result<()> {
        // Shared handle owns the connections; nothing to tear down here
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SqliteVectorStore) {
        let dir = tempfile::tempdir().unwrap();
        let handle = SqliteHandle::open(Some(dir.path().join("vec.db"))).unwrap();
        (dir, SqliteVectorStore::new(handle))
    }

    fn rec(id: &str, sector: &str, user: &str, v: Vec<f32>) -> VectorRecord {
        VectorRecord::new(id, sector, v).with_user(user)
    }

    #[tokio::test]
    async fn test_store_and_fetch() {
        let (_d, s) = store();
        s.store_vector(&rec("m1", "semantic", "u1", vec![1.0, 0.0]))
            .await
            .unwrap();
        s.store_vector(&rec("m1", "episodic", "u1", vec![0.0, 1.0]))
            .await
            .unwrap();

        let all = s.vectors_by_id("m1", None).await.unwrap();
        assert_eq!(all.len(), 2);

        let one = s.vector("m1", "semantic", Some("u1")).await.unwrap().unwrap();
        assert_eq!(one.vector, vec![1.0, 0.0]);
        assert!(s.vector("m1", "semantic", Some("u2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let (_d, s) = store();
        s.store_vector(&rec("m1", "semantic", "u1", vec![1.0, 0.0]))
            .await
            .unwrap();
        s.store_vector(&rec("m1", "semantic", "u1", vec![0.0, 1.0]))
            .await
            .unwrap();
        let got = s.vector("m1", "semantic", None).await.unwrap().unwrap();
        assert_eq!(got.vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_search_orders_by_cosine() {
        let (_d, s) = store();
        s.store_vectors(&[
            rec("close", "semantic", "u1", vec![1.0, 0.1, 0.0]),
            rec("far", "semantic", "u1", vec![0.0, 0.0, 1.0]),
            rec("other-sector", "episodic", "u1", vec![1.0, 0.0, 0.0]),
        ])
        .await
        .unwrap();

        let hits = s
            .search(&[1.0, 0.0, 0.0], "semantic", 10, &VectorFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "close");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_search_user_filter_and_saturation() {
        let (_d, s) = store();
        s.store_vector(&rec("m1", "semantic", "u1", vec![1.0, 0.0]))
            .await
            .unwrap();
        s.store_vector(&rec("m2", "semantic", "u2", vec![1.0, 0.0]))
            .await
            .unwrap();

        let f = VectorFilters {
            user_id: Some("u1".into()),
            ..Default::default()
        };
        // Asking for far more than exists returns what's there, no error
        let hits = s.search(&[1.0, 0.0], "semantic", 500, &f).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");
    }

    #[tokio::test]
    async fn test_delete_by_sector_and_all() {
        let (_d, s) = store();
        s.store_vectors(&[
            rec("m1", "semantic", "u1", vec![1.0]),
            rec("m1", "semantic_cold", "u1", vec![0.5]),
        ])
        .await
        .unwrap();

        s.delete_vectors("m1", Some("semantic")).await.unwrap();
        assert!(s.vector("m1", "semantic", None).await.unwrap().is_none());
        assert!(s.vector("m1", "semantic_cold", None).await.unwrap().is_some());

        s.delete_vectors("m1", None).await.unwrap();
        assert!(s.vectors_by_id("m1", None).await.unwrap().is_empty());
    }
}
