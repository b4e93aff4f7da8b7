//! External Postgres backend
//!
//! Pooled connections via sqlx; statements are written with the portable `?`
//! placeholder and rewritten to `$n` here. The engine-level transaction is a
//! pool-checked-out `Transaction<'static>` stored on the handle; while one is
//! open, every write routes through it and reads still hit the pool.

use super::{migrations, Result, Storage, StorageError, Tables};
use crate::types::{
    ClassifierModel, EmbedLog, EmbedStatus, MaintLog, MemoryRecord, Sector, SectorStat,
    UserProfile, Waypoint,
};
use crate::vectors::bytes_to_vec;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Rewrite `?` placeholders to `$1..$n`, leaving quoted literals alone.
pub fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0u32;
    let mut in_quote = false;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                out.push(c);
            }
            '?' if !in_quote => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

const MEM_COLS: &str = "id, user_id, segment, content, simhash, primary_sector, tags, metadata, \
     created_at, updated_at, last_seen_at, salience, decay_lambda, version, \
     mean_dim, mean_vec, compressed_vec, feedback_score, generated_summary";

// ============================================================================
// HANDLE
// ============================================================================

/// Shared pool + active engine transaction; the pgvector store reuses it.
pub struct PgHandle {
    pub(crate) pool: PgPool,
    pub(crate) txn: Mutex<Option<Transaction<'static, Postgres>>>,
    pub(crate) tables: Tables,
}

impl PgHandle {
    /// Connect and apply migrations.
    pub async fn connect(url: &str, schema: &str, base_table: &str) -> Result<Arc<Self>> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        let tables = Tables::postgres(schema, base_table);

        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (name TEXT PRIMARY KEY, applied_at BIGINT NOT NULL)",
        )
        .execute(&pool)
        .await?;

        for migration in migrations::POSTGRES_MIGRATIONS {
            let done: Option<i32> = sqlx::query_scalar("SELECT 1 FROM _migrations WHERE name = $1")
                .bind(migration.name)
                .fetch_optional(&pool)
                .await?;
            if done.is_some() {
                continue;
            }
            tracing::info!("[db] applying migration {}", migration.name);
            sqlx::raw_sql(&tables.resolve(migration.up)).execute(&pool).await?;
            sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES ($1, $2)")
                .bind(migration.name)
                .bind(chrono::Utc::now().timestamp_millis())
                .execute(&pool)
                .await?;
        }

        Ok(Arc::new(Self {
            pool,
            txn: Mutex::new(None),
            tables,
        }))
    }

    /// Resolve table placeholders and rewrite `?` to `$n`.
    pub(crate) fn sql(&self, template: &str) -> String {
        rewrite_placeholders(&self.tables.resolve(template))
    }

    pub(crate) async fn exec(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<u64> {
        let mut guard = self.txn.lock().await;
        let res = match guard.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(res.rows_affected())
    }

    pub(crate) async fn fetch_all(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<PgRow>> {
        let mut guard = self.txn.lock().await;
        let rows = match guard.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    pub(crate) async fn fetch_optional(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<PgRow>> {
        let mut guard = self.txn.lock().await;
        let row = match guard.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(row)
    }
}

fn row_to_memory(row: &PgRow) -> Result<MemoryRecord> {
    let sector: String = row.try_get("primary_sector")?;
    Ok(MemoryRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        segment: row.try_get("segment")?,
        content: row.try_get("content")?,
        simhash: row.try_get("simhash")?,
        primary_sector: Sector::parse_name(&sector),
        tags: row.try_get("tags")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        salience: row.try_get("salience")?,
        decay_lambda: row.try_get("decay_lambda")?,
        version: row.try_get("version")?,
        mean_dim: row.try_get("mean_dim")?,
        mean_vec: row.try_get("mean_vec")?,
        compressed_vec: row.try_get("compressed_vec")?,
        feedback_score: row.try_get("feedback_score")?,
        generated_summary: row.try_get("generated_summary")?,
    })
}

fn row_to_waypoint(row: &PgRow) -> Result<Waypoint> {
    Ok(Waypoint {
        src_id: row.try_get("src_id")?,
        dst_id: row.try_get("dst_id")?,
        user_id: row.try_get("user_id")?,
        weight: row.try_get("weight")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// The external row store.
pub struct PostgresStorage {
    handle: Arc<PgHandle>,
}

impl PostgresStorage {
    pub fn new(handle: Arc<PgHandle>) -> Self {
        Self { handle }
    }
}

// ============================================================================
// STORAGE IMPL
// ============================================================================

#[async_trait]
impl Storage for PostgresStorage {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    // ========== Transactions ==========

    async fn begin(&self) -> Result<()> {
        let mut guard = self.handle.txn.lock().await;
        if guard.is_none() {
            *guard = Some(self.handle.pool.begin().await?);
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let tx = self.handle.txn.lock().await.take();
        if let Some(tx) = tx {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self.handle.txn.lock().await.take();
        if let Some(tx) = tx {
            tx.rollback().await?;
        }
        Ok(())
    }

    // ========== Memories ==========

    async fn upsert_memory(&self, rec: &MemoryRecord) -> Result<()> {
        let sql = self.handle.sql(&format!(
            "INSERT INTO {{m}} ({MEM_COLS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
             ON CONFLICT (id) DO UPDATE SET
               user_id=excluded.user_id, segment=excluded.segment,
               content=excluded.content, simhash=excluded.simhash,
               primary_sector=excluded.primary_sector, tags=excluded.tags,
               metadata=excluded.metadata, created_at=excluded.created_at,
               updated_at=excluded.updated_at, last_seen_at=excluded.last_seen_at,
               salience=excluded.salience, decay_lambda=excluded.decay_lambda,
               version=excluded.version, mean_dim=excluded.mean_dim,
               mean_vec=excluded.mean_vec, compressed_vec=excluded.compressed_vec,
               feedback_score=excluded.feedback_score,
               generated_summary=excluded.generated_summary"
        ));
        let q = sqlx::query(&sql)
            .bind(&rec.id)
            .bind(&rec.user_id)
            .bind(rec.segment)
            .bind(&rec.content)
            .bind(&rec.simhash)
            .bind(rec.primary_sector.as_str())
            .bind(&rec.tags)
            .bind(&rec.metadata)
            .bind(rec.created_at)
            .bind(rec.updated_at)
            .bind(rec.last_seen_at)
            .bind(rec.salience)
            .bind(rec.decay_lambda)
            .bind(rec.version)
            .bind(rec.mean_dim)
            .bind(&rec.mean_vec)
            .bind(&rec.compressed_vec)
            .bind(rec.feedback_score)
            .bind(&rec.generated_summary);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn touch_memory(
        &self,
        id: &str,
        last_seen: i64,
        salience: f64,
        updated: i64,
        user_id: Option<&str>,
    ) -> Result<()> {
        let sql = self.handle.sql(
            "UPDATE {m} SET last_seen_at=?, salience=?, updated_at=? \
             WHERE id=? AND (?::text IS NULL OR user_id=?)",
        );
        let q = sqlx::query(&sql)
            .bind(last_seen)
            .bind(salience)
            .bind(updated)
            .bind(id)
            .bind(user_id)
            .bind(user_id);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn update_memory_content(
        &self,
        id: &str,
        content: &str,
        sector: Sector,
        tags: &str,
        metadata: &str,
        updated: i64,
        user_id: Option<&str>,
    ) -> Result<()> {
        let sql = self.handle.sql(
            "UPDATE {m} SET content=?, primary_sector=?, tags=?, metadata=?, updated_at=?, \
             version=version+1 WHERE id=? AND (?::text IS NULL OR user_id=?)",
        );
        let q = sqlx::query(&sql)
            .bind(content)
            .bind(sector.as_str())
            .bind(tags)
            .bind(metadata)
            .bind(updated)
            .bind(id)
            .bind(user_id)
            .bind(user_id);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn update_feedback(&self, id: &str, score: f64, user_id: Option<&str>) -> Result<()> {
        let sql = self
            .handle
            .sql("UPDATE {m} SET feedback_score=? WHERE id=? AND (?::text IS NULL OR user_id=?)");
        let q = sqlx::query(&sql).bind(score).bind(id).bind(user_id).bind(user_id);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn update_salience_batch(&self, rows: &[(f64, i64, String)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        // One statement over parallel arrays instead of a per-row loop
        let sql = self.handle.sql(
            "UPDATE {m} AS m SET salience = u.salience, updated_at = u.updated_at \
             FROM (SELECT UNNEST(?::float8[]) AS salience, UNNEST(?::int8[]) AS updated_at, \
                          UNNEST(?::text[]) AS id) AS u \
             WHERE m.id = u.id",
        );
        let saliences: Vec<f64> = rows.iter().map(|r| r.0).collect();
        let updates: Vec<i64> = rows.iter().map(|r| r.1).collect();
        let ids: Vec<String> = rows.iter().map(|r| r.2.clone()).collect();
        let q = sqlx::query(&sql).bind(saliences).bind(updates).bind(ids);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn set_generated_summary(&self, id: &str, summary: &str) -> Result<()> {
        let sql = self.handle.sql("UPDATE {m} SET generated_summary=? WHERE id=?");
        let q = sqlx::query(&sql).bind(summary).bind(id);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn mark_consolidated(&self, ids: &[String], updated: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = self.handle.sql(
            "UPDATE {m} SET metadata = \
               (jsonb_set(COALESCE(metadata, '{}')::jsonb, '{consolidated}', 'true'))::text, \
             updated_at=? WHERE id = ANY(?)",
        );
        let q = sqlx::query(&sql).bind(updated).bind(ids);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn scale_salience(&self, ids: &[String], factor: f64, updated: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = self.handle.sql(
            "UPDATE {m} SET salience = LEAST(1.0, COALESCE(salience, 0) * ?), updated_at=? \
             WHERE id = ANY(?)",
        );
        let q = sqlx::query(&sql).bind(factor).bind(updated).bind(ids);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn memory(&self, id: &str, user_id: Option<&str>) -> Result<Option<MemoryRecord>> {
        let sql = self.handle.sql(&format!(
            "SELECT {MEM_COLS} FROM {{m}} WHERE id=? AND (?::text IS NULL OR user_id=?)"
        ));
        let q = sqlx::query(&sql).bind(id).bind(user_id).bind(user_id);
        let row = self.handle.fetch_optional(q).await?;
        row.map(|r| row_to_memory(&r)).transpose()
    }

    async fn memory_by_simhash(
        &self,
        simhash: &str,
        user_id: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        let sql = self.handle.sql(&format!(
            "SELECT {MEM_COLS} FROM {{m}} WHERE simhash=? AND (?::text IS NULL OR user_id=?) \
             ORDER BY salience DESC LIMIT 1"
        ));
        let q = sqlx::query(&sql).bind(simhash).bind(user_id).bind(user_id);
        let row = self.handle.fetch_optional(q).await?;
        row.map(|r| row_to_memory(&r)).transpose()
    }

    async fn memories_by_ids(
        &self,
        ids: &[String],
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = self.handle.sql(&format!(
            "SELECT {MEM_COLS} FROM {{m}} WHERE id = ANY(?) AND (?::text IS NULL OR user_id=?)"
        ));
        let q = sqlx::query(&sql).bind(ids).bind(user_id).bind(user_id);
        let rows = self.handle.fetch_all(q).await?;
        rows.iter().map(row_to_memory).collect()
    }

    async fn recent_memories(
        &self,
        limit: i64,
        offset: i64,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let sql = self.handle.sql(&format!(
            "SELECT {MEM_COLS} FROM {{m}} WHERE (?::text IS NULL OR user_id=?) \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ));
        let q = sqlx::query(&sql)
            .bind(user_id)
            .bind(user_id)
            .bind(limit)
            .bind(offset);
        let rows = self.handle.fetch_all(q).await?;
        rows.iter().map(row_to_memory).collect()
    }

    async fn memories_by_sector(
        &self,
        sector: Sector,
        limit: i64,
        offset: i64,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let sql = self.handle.sql(&format!(
            "SELECT {MEM_COLS} FROM {{m}} WHERE primary_sector=? \
             AND (?::text IS NULL OR user_id=?) \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ));
        let q = sqlx::query(&sql)
            .bind(sector.as_str())
            .bind(user_id)
            .bind(user_id)
            .bind(limit)
            .bind(offset);
        let rows = self.handle.fetch_all(q).await?;
        rows.iter().map(row_to_memory).collect()
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        let sql = self.handle.sql("SELECT DISTINCT user_id FROM {m} ORDER BY user_id");
        let rows = self.handle.fetch_all(sqlx::query(&sql)).await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("user_id").map_err(StorageError::from))
            .collect()
    }

    // ========== Segments ==========

    async fn segments(&self) -> Result<Vec<i64>> {
        let sql = self.handle.sql("SELECT DISTINCT segment FROM {m} ORDER BY segment DESC");
        let rows = self.handle.fetch_all(sqlx::query(&sql)).await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("segment").map_err(StorageError::from))
            .collect()
    }

    async fn max_segment(&self, user_id: Option<&str>) -> Result<i64> {
        let sql = self
            .handle
            .sql("SELECT MAX(segment) AS max_seg FROM {m} WHERE (?::text IS NULL OR user_id=?)");
        let q = sqlx::query(&sql).bind(user_id).bind(user_id);
        let row = self.handle.fetch_optional(q).await?;
        Ok(row
            .and_then(|r| r.try_get::<Option<i64>, _>("max_seg").ok().flatten())
            .unwrap_or(0))
    }

    async fn segment_count(&self, segment: i64, user_id: Option<&str>) -> Result<i64> {
        let sql = self.handle.sql(
            "SELECT COUNT(*) AS c FROM {m} WHERE segment=? AND (?::text IS NULL OR user_id=?)",
        );
        let q = sqlx::query(&sql).bind(segment).bind(user_id).bind(user_id);
        let row = self.handle.fetch_optional(q).await?;
        Ok(row.and_then(|r| r.try_get::<i64, _>("c").ok()).unwrap_or(0))
    }

    async fn memories_in_segment(&self, segment: i64) -> Result<Vec<MemoryRecord>> {
        let sql = self
            .handle
            .sql(&format!("SELECT {MEM_COLS} FROM {{m}} WHERE segment=?"));
        let q = sqlx::query(&sql).bind(segment);
        let rows = self.handle.fetch_all(q).await?;
        rows.iter().map(row_to_memory).collect()
    }

    // ========== Deletion ==========

    async fn delete_memory(&self, id: &str, user_id: Option<&str>) -> Result<bool> {
        // When an engine transaction is open the deletes join it; otherwise
        // this opens and commits its own.
        let own_txn = self.handle.txn.lock().await.is_none();
        if own_txn {
            self.begin().await?;
        }
        let result: Result<bool> = async {
            let exists = self.memory(id, user_id).await?.is_some();
            if !exists {
                return Ok(false);
            }
            let sql = self.handle.sql("DELETE FROM {v} WHERE id=?");
            self.handle.exec(sqlx::query(&sql).bind(id)).await?;
            let sql = self.handle.sql("DELETE FROM {w} WHERE src_id=? OR dst_id=?");
            self.handle.exec(sqlx::query(&sql).bind(id).bind(id)).await?;
            let sql = self.handle.sql("DELETE FROM {m} WHERE id=?");
            self.handle.exec(sqlx::query(&sql).bind(id)).await?;
            Ok(true)
        }
        .await;
        if own_txn {
            match &result {
                Ok(_) => self.commit().await?,
                Err(_) => self.rollback().await?,
            }
        }
        result
    }

    async fn delete_user_memories(&self, user_id: &str) -> Result<u64> {
        let own_txn = self.handle.txn.lock().await.is_none();
        if own_txn {
            self.begin().await?;
        }
        let result: Result<u64> = async {
            let sql = self
                .handle
                .sql("DELETE FROM {v} WHERE id IN (SELECT id FROM {m} WHERE user_id=?)");
            self.handle.exec(sqlx::query(&sql).bind(user_id)).await?;
            let sql = self.handle.sql("DELETE FROM {w} WHERE user_id=?");
            self.handle.exec(sqlx::query(&sql).bind(user_id)).await?;
            let sql = self.handle.sql("DELETE FROM {m} WHERE user_id=?");
            let removed = self.handle.exec(sqlx::query(&sql).bind(user_id)).await?;
            Ok(removed)
        }
        .await;
        if own_txn {
            match &result {
                Ok(_) => self.commit().await?,
                Err(_) => self.rollback().await?,
            }
        }
        result
    }

    // ========== Waypoints ==========

    async fn upsert_waypoint(&self, wp: &Waypoint) -> Result<()> {
        let sql = self.handle.sql(
            "INSERT INTO {w} (src_id, dst_id, user_id, weight, created_at, updated_at) \
             VALUES (?,?,?,?,?,?) \
             ON CONFLICT (src_id, dst_id, user_id) DO UPDATE SET \
               weight=excluded.weight, updated_at=excluded.updated_at",
        );
        let q = sqlx::query(&sql)
            .bind(&wp.src_id)
            .bind(&wp.dst_id)
            .bind(&wp.user_id)
            .bind(wp.weight)
            .bind(wp.created_at)
            .bind(wp.updated_at);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn waypoint(&self, src: &str, dst: &str) -> Result<Option<Waypoint>> {
        let sql = self.handle.sql(
            "SELECT src_id, dst_id, user_id, weight, created_at, updated_at \
             FROM {w} WHERE src_id=? AND dst_id=?",
        );
        let q = sqlx::query(&sql).bind(src).bind(dst);
        let row = self.handle.fetch_optional(q).await?;
        row.map(|r| row_to_waypoint(&r)).transpose()
    }

    async fn neighbors(&self, src_ids: &[String], user_id: Option<&str>) -> Result<Vec<Waypoint>> {
        if src_ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = self.handle.sql(
            "SELECT src_id, dst_id, user_id, weight, created_at, updated_at \
             FROM {w} WHERE src_id = ANY(?) AND (?::text IS NULL OR user_id=?) \
             ORDER BY weight DESC",
        );
        let q = sqlx::query(&sql).bind(src_ids).bind(user_id).bind(user_id);
        let rows = self.handle.fetch_all(q).await?;
        rows.iter().map(row_to_waypoint).collect()
    }

    async fn bump_waypoints(
        &self,
        path: &[String],
        boost: f64,
        cap: f64,
        user_id: &str,
        now: i64,
    ) -> Result<()> {
        if path.len() < 2 {
            return Ok(());
        }
        let sql = self.handle.sql(
            "UPDATE {w} SET weight = LEAST(?, weight + ?), updated_at=? \
             WHERE src_id=? AND dst_id=? AND user_id=?",
        );
        for pair in path.windows(2) {
            let q = sqlx::query(&sql)
                .bind(cap)
                .bind(boost)
                .bind(now)
                .bind(&pair[0])
                .bind(&pair[1])
                .bind(user_id);
            self.handle.exec(q).await?;
        }
        Ok(())
    }

    async fn prune_waypoints(&self, threshold: f64) -> Result<u64> {
        let sql = self.handle.sql("DELETE FROM {w} WHERE weight < ?");
        self.handle.exec(sqlx::query(&sql).bind(threshold)).await
    }

    async fn delete_orphans(&self) -> Result<(u64, u64)> {
        let own_txn = self.handle.txn.lock().await.is_none();
        if own_txn {
            self.begin().await?;
        }
        let result: Result<(u64, u64)> = async {
            let sql = self
                .handle
                .sql("DELETE FROM {v} WHERE id NOT IN (SELECT id FROM {m})");
            let vectors = self.handle.exec(sqlx::query(&sql)).await?;
            let sql = self.handle.sql(
                "DELETE FROM {w} WHERE src_id NOT IN (SELECT id FROM {m}) \
                 OR dst_id NOT IN (SELECT id FROM {m})",
            );
            let waypoints = self.handle.exec(sqlx::query(&sql)).await?;
            Ok((vectors, waypoints))
        }
        .await;
        if own_txn {
            match &result {
                Ok(_) => self.commit().await?,
                Err(_) => self.rollback().await?,
            }
        }
        result
    }

    // ========== Classifier ==========

    async fn classifier_model(&self, user_id: &str) -> Result<Option<ClassifierModel>> {
        let sql = self
            .handle
            .sql("SELECT weights, biases, version, updated_at FROM {lm} WHERE user_id=?");
        let q = sqlx::query(&sql).bind(user_id);
        let Some(row) = self.handle.fetch_optional(q).await? else {
            return Ok(None);
        };
        let weights: String = row.try_get("weights")?;
        let biases: String = row.try_get("biases")?;
        Ok(Some(ClassifierModel {
            weights: serde_json::from_str(&weights)
                .map_err(|e| StorageError::CorruptRow(format!("model weights: {e}")))?,
            biases: serde_json::from_str(&biases)
                .map_err(|e| StorageError::CorruptRow(format!("model biases: {e}")))?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn put_classifier_model(&self, user_id: &str, model: &ClassifierModel) -> Result<()> {
        let weights = serde_json::to_string(&model.weights)
            .map_err(|e| StorageError::CorruptRow(e.to_string()))?;
        let biases = serde_json::to_string(&model.biases)
            .map_err(|e| StorageError::CorruptRow(e.to_string()))?;
        let sql = self.handle.sql(
            "INSERT INTO {lm} (user_id, weights, biases, version, updated_at) VALUES (?,?,?,?,?) \
             ON CONFLICT (user_id) DO UPDATE SET weights=excluded.weights, \
               biases=excluded.biases, version=excluded.version, updated_at=excluded.updated_at",
        );
        let q = sqlx::query(&sql)
            .bind(user_id)
            .bind(weights)
            .bind(biases)
            .bind(model.version)
            .bind(model.updated_at);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn training_data(&self, user_id: &str, limit: i64) -> Result<Vec<(Vec<f32>, Sector)>> {
        let sql = self.handle.sql(
            "SELECT mean_vec, primary_sector FROM {m} \
             WHERE user_id=? AND mean_vec IS NOT NULL \
             ORDER BY created_at DESC LIMIT ?",
        );
        let q = sqlx::query(&sql).bind(user_id).bind(limit);
        let rows = self.handle.fetch_all(q).await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let buf: Vec<u8> = r.try_get("mean_vec").ok()?;
                let sector: String = r.try_get("primary_sector").ok()?;
                bytes_to_vec(&buf).map(|v| (v, Sector::parse_name(&sector)))
            })
            .collect())
    }

    // ========== Logs & stats ==========

    async fn insert_embed_log(&self, log: &EmbedLog) -> Result<()> {
        let sql = self
            .handle
            .sql("INSERT INTO {el} (id, model, status, ts, err, user_id) VALUES (?,?,?,?,?,?)");
        let q = sqlx::query(&sql)
            .bind(&log.id)
            .bind(&log.model)
            .bind(log.status.as_str())
            .bind(log.ts)
            .bind(&log.err)
            .bind(&log.user_id);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn update_embed_log(
        &self,
        id: &str,
        status: EmbedStatus,
        err: Option<&str>,
    ) -> Result<()> {
        let sql = self.handle.sql("UPDATE {el} SET status=?, err=? WHERE id=?");
        let q = sqlx::query(&sql).bind(status.as_str()).bind(err).bind(id);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn embed_logs_by_status(
        &self,
        status: EmbedStatus,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<EmbedLog>> {
        let sql = self.handle.sql(
            "SELECT id, model, status, ts, err, user_id FROM {el} \
             WHERE status=? AND (?::text IS NULL OR user_id=?) \
             ORDER BY ts DESC LIMIT ?",
        );
        let q = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(user_id)
            .bind(user_id)
            .bind(limit);
        let rows = self.handle.fetch_all(q).await?;
        rows.iter()
            .map(|r| {
                let status: String = r.try_get("status")?;
                Ok(EmbedLog {
                    id: r.try_get("id")?,
                    model: r.try_get("model")?,
                    status: match status.as_str() {
                        "completed" => EmbedStatus::Completed,
                        "failed" => EmbedStatus::Failed,
                        _ => EmbedStatus::Pending,
                    },
                    ts: r.try_get("ts")?,
                    err: r.try_get("err")?,
                    user_id: r.try_get("user_id")?,
                })
            })
            .collect()
    }

    async fn append_stat(&self, kind: &str, count: i64, ts: i64) -> Result<()> {
        let sql = self.handle.sql("INSERT INTO {s} (type, count, ts) VALUES (?,?,?)");
        let q = sqlx::query(&sql).bind(kind).bind(count).bind(ts);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn sector_stats(&self, user_id: Option<&str>) -> Result<Vec<SectorStat>> {
        let sql = self.handle.sql(
            "SELECT primary_sector, COUNT(*) AS c, AVG(salience) AS avg_sal FROM {m} \
             WHERE (?::text IS NULL OR user_id=?) GROUP BY primary_sector",
        );
        let q = sqlx::query(&sql).bind(user_id).bind(user_id);
        let rows = self.handle.fetch_all(q).await?;
        rows.iter()
            .map(|r| {
                Ok(SectorStat {
                    sector: r.try_get("primary_sector")?,
                    count: r.try_get("c")?,
                    avg_salience: r.try_get::<Option<f64>, _>("avg_sal")?.unwrap_or(0.0),
                })
            })
            .collect()
    }

    async fn delete_stats_before(&self, ts: i64) -> Result<u64> {
        let sql = self.handle.sql("DELETE FROM {s} WHERE ts < ?");
        self.handle.exec(sqlx::query(&sql).bind(ts)).await
    }

    async fn append_maint_log(&self, log: &MaintLog) -> Result<()> {
        let sql = self.handle.sql(
            "INSERT INTO {ml} (id, type, status, ts, details) VALUES (?,?,?,?,?) \
             ON CONFLICT (id) DO UPDATE SET status=excluded.status, details=excluded.details",
        );
        let q = sqlx::query(&sql)
            .bind(&log.id)
            .bind(&log.op)
            .bind(&log.status)
            .bind(log.ts)
            .bind(&log.details);
        self.handle.exec(q).await?;
        Ok(())
    }

    // ========== Users ==========

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let sql = self.handle.sql(
            "SELECT id, summary, reflection_count, created_at, updated_at, metadata \
             FROM {u} WHERE id=?",
        );
        let q = sqlx::query(&sql).bind(user_id);
        let Some(row) = self.handle.fetch_optional(q).await? else {
            return Ok(None);
        };
        Ok(Some(UserProfile {
            user_id: row.try_get("id")?,
            summary: row.try_get("summary")?,
            reflection_count: row.try_get("reflection_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            metadata: row.try_get("metadata")?,
        }))
    }

    async fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()> {
        let sql = self.handle.sql(
            "INSERT INTO {u} (id, summary, reflection_count, created_at, updated_at, metadata) \
             VALUES (?,?,?,?,?,?) \
             ON CONFLICT (id) DO UPDATE SET summary=excluded.summary, \
               reflection_count=excluded.reflection_count, updated_at=excluded.updated_at, \
               metadata=excluded.metadata",
        );
        let q = sqlx::query(&sql)
            .bind(&profile.user_id)
            .bind(&profile.summary)
            .bind(profile.reflection_count)
            .bind(profile.created_at)
            .bind(profile.updated_at)
            .bind(&profile.metadata);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn update_user_summary(&self, user_id: &str, summary: &str, updated: i64) -> Result<()> {
        let sql = self.handle.sql("UPDATE {u} SET summary=?, updated_at=? WHERE id=?");
        let q = sqlx::query(&sql).bind(summary).bind(updated).bind(user_id);
        self.handle.exec(q).await?;
        Ok(())
    }

    async fn bump_reflection_count(&self, user_id: &str) -> Result<()> {
        let sql = self
            .handle
            .sql("UPDATE {u} SET reflection_count = reflection_count + 1 WHERE id=?");
        self.handle.exec(sqlx::query(&sql).bind(user_id)).await?;
        Ok(())
    }

    // ========== Maintenance ==========

    async fn rewrite_contents(&self, rows: &[(String, String)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let own_txn = self.handle.txn.lock().await.is_none();
        if own_txn {
            self.begin().await?;
        }
        let result: Result<()> = async {
            let sql = self.handle.sql("UPDATE {m} SET content=? WHERE id=?");
            for (id, content) in rows {
                self.handle
                    .exec(sqlx::query(&sql).bind(content).bind(id))
                    .await?;
            }
            Ok(())
        }
        .await;
        if own_txn {
            match &result {
                Ok(_) => self.commit().await?,
                Err(_) => self.rollback().await?,
            }
        }
        result
    }

    async fn optimize(&self) -> Result<()> {
        sqlx::raw_sql("ANALYZE").execute(&self.handle.pool).await?;
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
    fn test_placeholder_rewrite() {
        assert_eq!(
            rewrite_placeholders("SELECT * FROM t WHERE a=? AND b=?"),
            "SELECT * FROM t WHERE a=$1 AND b=$2"
        );
        // Quoted question marks survive
        assert_eq!(
            rewrite_placeholders("SELECT '?' , x FROM t WHERE y=?"),
            "SELECT '?' , x FROM t WHERE y=$1"
        );
        assert_eq!(rewrite_placeholders("no params"), "no params");
    }
}
