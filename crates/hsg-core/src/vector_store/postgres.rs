//! Postgres/pgvector vector store
//!
//! Delegates similarity to the native `<=>` cosine-distance operator on a
//! pgvector column, with user-id filter pushdown and the same metadata
//! substring predicates as the embedded store (joined against the memories
//! table). Vectors travel as `[...]::vector` literals so no client-side
//! vector type is needed.

use super::{VectorFilters, VectorMatch, VectorStore};
use crate::storage::postgres::PgHandle;
use crate::storage::Result;
use crate::types::VectorRecord;
use async_trait::async_trait;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;

pub struct PostgresVectorStore {
    handle: Arc<PgHandle>,
}

impl PostgresVectorStore {
    pub fn new(handle: Arc<PgHandle>) -> Self {
        Self { handle }
    }
}

/// `[0.1,0.2,...]` literal accepted by pgvector
fn vector_literal(v: &[f32]) -> String {
    let mut s = String::with_capacity(v.len() * 8 + 2);
    s.push('[');
    for (i, x) in v.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push_str(&x.to_string());
    }
    s.push(']');
    s
}

/// Parse a pgvector text representation back into f32s
fn parse_vector(text: &str) -> Option<Vec<f32>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(vec![]);
    }
    inner
        .split(',')
        .map(|p| p.trim().parse::<f32>().ok())
        .collect()
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<Option<VectorRecord>> {
    let id: String = row.try_get("id")?;
    let sector: String = row.try_get("sector")?;
    let user_id: Option<String> = row.try_get("user_id")?;
    let text: String = row.try_get("v_text")?;
    let dim: i64 = row.try_get("dim")?;
    Ok(parse_vector(&text).map(|vector| VectorRecord {
        id,
        sector,
        user_id,
        vector,
        dim: dim as usize,
    }))
}

#[async_trait]
impl VectorStore for PostgresVectorStore {
    async fn store_vector(&self, rec: &VectorRecord) -> Result<()> {
        let sql = self.handle.sql(
            "INSERT INTO {v} (id, sector, user_id, v, dim) VALUES (?,?,?,?::vector,?) \
             ON CONFLICT (id, sector) DO UPDATE SET \
               user_id=excluded.user_id, v=excluded.v, dim=excluded.dim",
        );
        let q = sqlx::query(&sql)
            .bind(&rec.id)
            .bind(&rec.sector)
            .bind(&rec.user_id)
            .bind(vector_literal(&rec.vector))
            .bind(rec.dim as i64);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn store_vectors(&self, recs: &[VectorRecord]) -> Result<()> {
        for rec in recs {
            self.store_vector(rec).await?;
        }
        Ok(())
    }

    async fn vectors_by_id(&self, id: &str, user_id: Option<&str>) -> Result<Vec<VectorRecord>> {
        let sql = self.handle.sql(
            "SELECT id, sector, user_id, v::text AS v_text, dim FROM {v} \
             WHERE id=? AND (?::text IS NULL OR user_id=?)",
        );
        let q = sqlx::query(&sql).bind(id).bind(user_id).bind(user_id);
        let rows = self.handle.fetch_all(q).await?;
        Ok(rows
            .iter()
            .filter_map(|r| row_to_record(r).transpose())
            .collect::<Result<Vec<_>>>()?)
    }

    async fn vectors_by_ids(
        &self,
        ids: &[String],
        user_id: Option<&str>,
    ) -> Result<HashMap<String, Vec<VectorRecord>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = self.handle.sql(
            "SELECT id, sector, user_id, v::text AS v_text, dim FROM {v} \
             WHERE id = ANY(?) AND (?::text IS NULL OR user_id=?)",
        );
        let q = sqlx::query(&sql).bind(ids).bind(user_id).bind(user_id);
        let rows = self.handle.fetch_all(q).await?;

        let mut out: HashMap<String, Vec<VectorRecord>> = HashMap::new();
        for row in &rows {
            if let Some(rec) = row_to_record(row)? {
                out.entry(rec.id.clone()).or_default().push(rec);
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
        let sql = self.handle.sql(
            "SELECT id, sector, user_id, v::text AS v_text, dim FROM {v} \
             WHERE id=? AND sector=? AND (?::text IS NULL OR user_id=?)",
        );
        let q = sqlx::query(&sql)
            .bind(id)
            .bind(sector)
            .bind(user_id)
            .bind(user_id);
        let row = self.handle.fetch_optional(q).await?;
        match row {
            Some(r) => row_to_record(&r),
            None => Ok(None),
        }
    }

    async fn recent_vectors(
        &self,
        sector: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>> {
        let sql = self.handle.sql(
            "SELECT id, sector, user_id, v::text AS v_text, dim FROM {v} \
             WHERE sector=? AND (?::text IS NULL OR user_id=?) \
             ORDER BY id DESC LIMIT ?",
        );
        let q = sqlx::query(&sql)
            .bind(sector)
            .bind(user_id)
            .bind(user_id)
            .bind(limit as i64);
        let rows = self.handle.fetch_all(q).await?;
        Ok(rows
            .iter()
            .filter_map(|r| row_to_record(r).transpose())
            .collect::<Result<Vec<_>>>()?)
    }

    async fn delete_vectors(&self, id: &str, sector: Option<&str>) -> Result<()> {
        match sector {
            Some(s) => {
                let sql = self.handle.sql("DELETE FROM {v} WHERE id=? AND sector=?");
                self.handle.exec(sqlx::query(&sql).bind(id).bind(s)).await?;
            }
            None => {
                let sql = self.handle.sql("DELETE FROM {v} WHERE id=?");
                self.handle.exec(sqlx::query(&sql).bind(id)).await?;
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
        let has_meta = filters
            .metadata
            .as_ref()
            .map(|m| !m.is_empty())
            .unwrap_or(false);

        // The literal binds once; placeholders are numbered after rewrite, so
        // the template repeats `?` in the order the binds are applied.
        let mut template = if has_meta {
            "SELECT v.id, 1 - (v.v <=> ?::vector) AS score \
             FROM {v} v JOIN {m} m ON m.id = v.id WHERE v.sector = ?"
                .to_string()
        } else {
            "SELECT id, 1 - (v <=> ?::vector) AS score FROM {v} WHERE sector = ?".to_string()
        };

        let mut meta_needles: Vec<String> = Vec::new();
        if filters.user_id.is_some() {
            let col = if has_meta { "v.user_id" } else { "user_id" };
            template.push_str(&format!(" AND {col} = ?"));
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
                template.push_str(" AND m.metadata LIKE ?");
                meta_needles.push(format!("%{key}%{needle}%"));
            }
        }
        template.push_str(&format!(
            " ORDER BY {} <=> ?::vector LIMIT ?",
            if has_meta { "v.v" } else { "v" }
        ));

        let sql = self.handle.sql(&template);
        let literal = vector_literal(query);
        let mut q = sqlx::query(&sql).bind(&literal).bind(sector);
        if let Some(u) = &filters.user_id {
            q = q.bind(u);
        }
        for needle in &meta_needles {
            q = q.bind(needle);
        }
        q = q.bind(&literal).bind(k as i64);

        let rows = self.handle.fetch_all(q).await?;
        rows.iter()
            .map(|r| {
                Ok(VectorMatch {
                    id: r.try_get("id")?,
                    score: r.try_get::<f64, _>("score")? as f32,
                })
            })
            .collect::<Result<Vec<_>>>()
    }

    async fn disconnect(&self) -> Result<()> {
        // Pool teardown happens when the handle drops; nothing extra here
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal_roundtrip() {
        let v = vec![0.5f32, -1.25, 3.0];
        let lit = vector_literal(&v);
        assert_eq!(lit, "[0.5,-1.25,3]");
        assert_eq!(parse_vector(&lit).unwrap(), v);
        assert_eq!(parse_vector("[]").unwrap(), Vec::<f32>::new());
        assert!(parse_vector("not a vector").is_none());
    }
}
