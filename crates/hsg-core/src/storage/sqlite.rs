//! Embedded SQLite backend
//!
//! Separate writer/reader connections over one WAL database file. The writer
//! is serialized behind a Mutex; the engine additionally holds an async write
//! gate around multi-statement transactions so they never interleave. The
//! vector store shares this handle, keeping vectors and rows in one file.

use super::migrations;
use super::{Result, Storage, StorageError, Tables};
use crate::types::{
    ClassifierModel, EmbedLog, EmbedStatus, MaintLog, MemoryRecord, Sector, SectorStat,
    UserProfile, Waypoint,
};
use crate::vectors::bytes_to_vec;
use async_trait::async_trait;
use directories::ProjectDirs;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const MEM_COLS: &str = "id, user_id, segment, content, simhash, primary_sector, tags, metadata, \
     created_at, updated_at, last_seen_at, salience, decay_lambda, version, \
     mean_dim, mean_vec, compressed_vec, feedback_score, generated_summary";

// ============================================================================
// HANDLE
// ============================================================================

/// Shared connection pair; the row store and the vector store both hold an
/// `Arc` of this.
pub struct SqliteHandle {
    pub(crate) writer: Mutex<Connection>,
    pub(crate) reader: Mutex<Connection>,
    pub(crate) tables: Tables,
}

impl SqliteHandle {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;
             PRAGMA mmap_size = 268435456;",
        )?;
        Ok(())
    }

    /// Open (or create) the database, applying migrations on the writer.
    /// `None` uses the platform data directory.
    pub fn open(db_path: Option<PathBuf>) -> Result<Arc<Self>> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("dev", "hsg", "core").ok_or_else(|| {
                    StorageError::Init("Could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o700);
                    let _ = std::fs::set_permissions(data_dir, perms);
                }
                data_dir.join("hsg.db")
            }
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tables = Tables::sqlite();

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer)?;
        migrations::apply_sqlite(&writer, &tables)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            tables,
        }))
    }

    pub(crate) fn write_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("Writer lock poisoned".into()))
    }

    pub(crate) fn read_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("Reader lock poisoned".into()))
    }

    pub(crate) fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<MemoryRecord> {
        let sector: String = row.get(5)?;
        Ok(MemoryRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            segment: row.get(2)?,
            content: row.get(3)?,
            simhash: row.get(4)?,
            primary_sector: Sector::parse_name(&sector),
            tags: row.get(6)?,
            metadata: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            last_seen_at: row.get(10)?,
            salience: row.get(11)?,
            decay_lambda: row.get(12)?,
            version: row.get(13)?,
            mean_dim: row.get(14)?,
            mean_vec: row.get(15)?,
            compressed_vec: row.get(16)?,
            feedback_score: row.get(17)?,
            generated_summary: row.get(18)?,
        })
    }
}

/// The row store over a shared handle.
pub struct SqliteStorage {
    handle: Arc<SqliteHandle>,
}

impl SqliteStorage {
    pub fn new(handle: Arc<SqliteHandle>) -> Self {
        Self { handle }
    }

    fn t(&self) -> &Tables {
        &self.handle.tables
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

// ============================================================================
// STORAGE IMPL
// ============================================================================

#[async_trait]
impl Storage for SqliteStorage {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    // ========== Transactions ==========

    async fn begin(&self) -> Result<()> {
        self.handle.write_conn()?.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.handle.write_conn()?.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        // Rolling back without an open transaction is a no-op, not an error;
        // callers reach here from failure paths where state is uncertain.
        if let Err(e) = self.handle.write_conn()?.execute_batch("ROLLBACK") {
            tracing::debug!("[db] rollback ignored: {e}");
        }
        Ok(())
    }

    // ========== Memories ==========

    async fn upsert_memory(&self, rec: &MemoryRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {m} ({MEM_COLS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
             ON CONFLICT(id) DO UPDATE SET
               user_id=excluded.user_id, segment=excluded.segment,
               content=excluded.content, simhash=excluded.simhash,
               primary_sector=excluded.primary_sector, tags=excluded.tags,
               metadata=excluded.metadata, created_at=excluded.created_at,
               updated_at=excluded.updated_at, last_seen_at=excluded.last_seen_at,
               salience=excluded.salience, decay_lambda=excluded.decay_lambda,
               version=excluded.version, mean_dim=excluded.mean_dim,
               mean_vec=excluded.mean_vec, compressed_vec=excluded.compressed_vec,
               feedback_score=excluded.feedback_score,
               generated_summary=excluded.generated_summary",
            m = self.t().memories
        );
        self.handle.write_conn()?.execute(
            &sql,
            params![
                rec.id,
                rec.user_id,
                rec.segment,
                rec.content,
                rec.simhash,
                rec.primary_sector.as_str(),
                rec.tags,
                rec.metadata,
                rec.created_at,
                rec.updated_at,
                rec.last_seen_at,
                rec.salience,
                rec.decay_lambda,
                rec.version,
                rec.mean_dim,
                rec.mean_vec,
                rec.compressed_vec,
                rec.feedback_score,
                rec.generated_summary,
            ],
        )?;
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
        let conn = self.handle.write_conn()?;
        match user_id {
            Some(u) => {
                let sql = format!(
                    "UPDATE {} SET last_seen_at=?, salience=?, updated_at=? WHERE id=? AND user_id=?",
                    self.t().memories
                );
                conn.execute(&sql, params![last_seen, salience, updated, id, u])?;
            }
            None => {
                let sql = format!(
                    "UPDATE {} SET last_seen_at=?, salience=?, updated_at=? WHERE id=?",
                    self.t().memories
                );
                conn.execute(&sql, params![last_seen, salience, updated, id])?;
            }
        }
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
        let conn = self.handle.write_conn()?;
        match user_id {
            Some(u) => {
                let sql = format!(
                    "UPDATE {} SET content=?, primary_sector=?, tags=?, metadata=?, updated_at=?, \
                     version=version+1 WHERE id=? AND user_id=?",
                    self.t().memories
                );
                conn.execute(
                    &sql,
                    params![content, sector.as_str(), tags, metadata, updated, id, u],
                )?;
            }
            None => {
                let sql = format!(
                    "UPDATE {} SET content=?, primary_sector=?, tags=?, metadata=?, updated_at=?, \
                     version=version+1 WHERE id=?",
                    self.t().memories
                );
                conn.execute(&sql, params![content, sector.as_str(), tags, metadata, updated, id])?;
            }
        }
        Ok(())
    }

    async fn update_feedback(&self, id: &str, score: f64, user_id: Option<&str>) -> Result<()> {
        let conn = self.handle.write_conn()?;
        match user_id {
            Some(u) => {
                let sql = format!(
                    "UPDATE {} SET feedback_score=? WHERE id=? AND user_id=?",
                    self.t().memories
                );
                conn.execute(&sql, params![score, id, u])?;
            }
            None => {
                let sql = format!("UPDATE {} SET feedback_score=? WHERE id=?", self.t().memories);
                conn.execute(&sql, params![score, id])?;
            }
        }
        Ok(())
    }

    async fn update_salience_batch(&self, rows: &[(f64, i64, String)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = self.handle.write_conn()?;
        let sql = format!(
            "UPDATE {} SET salience=?, updated_at=? WHERE id=?",
            self.t().memories
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        for (salience, updated, id) in rows {
            stmt.execute(params![salience, updated, id])?;
        }
        Ok(())
    }

    async fn set_generated_summary(&self, id: &str, summary: &str) -> Result<()> {
        let sql = format!("UPDATE {} SET generated_summary=? WHERE id=?", self.t().memories);
        self.handle.write_conn()?.execute(&sql, params![summary, id])?;
        Ok(())
    }

    async fn mark_consolidated(&self, ids: &[String], updated: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET metadata = json_set(COALESCE(metadata, '{{}}'), '$.consolidated', json('true')), \
             updated_at=? WHERE id IN ({})",
            self.t().memories,
            in_placeholders(ids.len())
        );
        let conn = self.handle.write_conn()?;
        let mut values: Vec<rusqlite::types::Value> = vec![updated.into()];
        values.extend(ids.iter().map(|id| rusqlite::types::Value::from(id.clone())));
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    async fn scale_salience(&self, ids: &[String], factor: f64, updated: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET salience = MIN(1.0, COALESCE(salience, 0) * ?), updated_at=? \
             WHERE id IN ({})",
            self.t().memories,
            in_placeholders(ids.len())
        );
        let conn = self.handle.write_conn()?;
        let mut values: Vec<rusqlite::types::Value> = vec![factor.into(), updated.into()];
        values.extend(ids.iter().map(|id| rusqlite::types::Value::from(id.clone())));
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    async fn memory(&self, id: &str, user_id: Option<&str>) -> Result<Option<MemoryRecord>> {
        let conn = self.handle.read_conn()?;
        let rec = match user_id {
            Some(u) => {
                let sql = format!(
                    "SELECT {MEM_COLS} FROM {} WHERE id=? AND user_id=?",
                    self.t().memories
                );
                conn.query_row(&sql, params![id, u], SqliteHandle::row_to_memory)
                    .optional()?
            }
            None => {
                let sql = format!("SELECT {MEM_COLS} FROM {} WHERE id=?", self.t().memories);
                conn.query_row(&sql, params![id], SqliteHandle::row_to_memory)
                    .optional()?
            }
        };
        Ok(rec)
    }

    async fn memory_by_simhash(
        &self,
        simhash: &str,
        user_id: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        let conn = self.handle.read_conn()?;
        let rec = match user_id {
            Some(u) => {
                let sql = format!(
                    "SELECT {MEM_COLS} FROM {} WHERE simhash=? AND user_id=? \
                     ORDER BY salience DESC LIMIT 1",
                    self.t().memories
                );
                conn.query_row(&sql, params![simhash, u], SqliteHandle::row_to_memory)
                    .optional()?
            }
            None => {
                let sql = format!(
                    "SELECT {MEM_COLS} FROM {} WHERE simhash=? ORDER BY salience DESC LIMIT 1",
                    self.t().memories
                );
                conn.query_row(&sql, params![simhash], SqliteHandle::row_to_memory)
                    .optional()?
            }
        };
        Ok(rec)
    }

    async fn memories_by_ids(
        &self,
        ids: &[String],
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.handle.read_conn()?;
        let mut sql = format!(
            "SELECT {MEM_COLS} FROM {} WHERE id IN ({})",
            self.t().memories,
            in_placeholders(ids.len())
        );
        let mut values: Vec<rusqlite::types::Value> =
            ids.iter().map(|id| rusqlite::types::Value::from(id.clone())).collect();
        if let Some(u) = user_id {
            sql.push_str(" AND user_id=?");
            values.push(u.to_string().into());
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), SqliteHandle::row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn recent_memories(
        &self,
        limit: i64,
        offset: i64,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.handle.read_conn()?;
        let rows = match user_id {
            Some(u) => {
                let sql = format!(
                    "SELECT {MEM_COLS} FROM {} WHERE user_id=? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                    self.t().memories
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![u, limit, offset], SqliteHandle::row_to_memory)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {MEM_COLS} FROM {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
                    self.t().memories
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![limit, offset], SqliteHandle::row_to_memory)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    async fn memories_by_sector(
        &self,
        sector: Sector,
        limit: i64,
        offset: i64,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.handle.read_conn()?;
        let rows = match user_id {
            Some(u) => {
                let sql = format!(
                    "SELECT {MEM_COLS} FROM {} WHERE primary_sector=? AND user_id=? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                    self.t().memories
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(
                    params![sector.as_str(), u, limit, offset],
                    SqliteHandle::row_to_memory,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {MEM_COLS} FROM {} WHERE primary_sector=? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                    self.t().memories
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(
                    params![sector.as_str(), limit, offset],
                    SqliteHandle::row_to_memory,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        let conn = self.handle.read_conn()?;
        let sql = format!(
            "SELECT DISTINCT user_id FROM {} ORDER BY user_id",
            self.t().memories
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========== Segments ==========

    async fn segments(&self) -> Result<Vec<i64>> {
        let conn = self.handle.read_conn()?;
        let sql = format!(
            "SELECT DISTINCT segment FROM {} ORDER BY segment DESC",
            self.t().memories
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn max_segment(&self, user_id: Option<&str>) -> Result<i64> {
        let conn = self.handle.read_conn()?;
        let max: Option<i64> = match user_id {
            Some(u) => {
                let sql = format!(
                    "SELECT MAX(segment) FROM {} WHERE user_id=?",
                    self.t().memories
                );
                conn.query_row(&sql, params![u], |r| r.get(0))?
            }
            None => {
                let sql = format!("SELECT MAX(segment) FROM {}", self.t().memories);
                conn.query_row(&sql, [], |r| r.get(0))?
            }
        };
        Ok(max.unwrap_or(0))
    }

    async fn segment_count(&self, segment: i64, user_id: Option<&str>) -> Result<i64> {
        let conn = self.handle.read_conn()?;
        let n: i64 = match user_id {
            Some(u) => {
                let sql = format!(
                    "SELECT COUNT(*) FROM {} WHERE segment=? AND user_id=?",
                    self.t().memories
                );
                conn.query_row(&sql, params![segment, u], |r| r.get(0))?
            }
            None => {
                let sql = format!("SELECT COUNT(*) FROM {} WHERE segment=?", self.t().memories);
                conn.query_row(&sql, params![segment], |r| r.get(0))?
            }
        };
        Ok(n)
    }

    async fn memories_in_segment(&self, segment: i64) -> Result<Vec<MemoryRecord>> {
        let conn = self.handle.read_conn()?;
        let sql = format!("SELECT {MEM_COLS} FROM {} WHERE segment=?", self.t().memories);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![segment], SqliteHandle::row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========== Deletion ==========

    async fn delete_memory(&self, id: &str, user_id: Option<&str>) -> Result<bool> {
        let t = self.t().clone();
        let mut conn = self.handle.write_conn()?;
        let tx = conn.transaction()?;
        let removed = {
            let exists: Option<String> = match user_id {
                Some(u) => tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE id=? AND user_id=?", t.memories),
                        params![id, u],
                        |r| r.get(0),
                    )
                    .optional()?,
                None => tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE id=?", t.memories),
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()?,
            };
            if exists.is_none() {
                false
            } else {
                tx.execute(&format!("DELETE FROM {} WHERE id=?", t.vectors), params![id])?;
                tx.execute(
                    &format!("DELETE FROM {} WHERE src_id=? OR dst_id=?", t.waypoints),
                    params![id, id],
                )?;
                tx.execute(&format!("DELETE FROM {} WHERE id=?", t.memories), params![id])?;
                true
            }
        };
        tx.commit()?;
        Ok(removed)
    }

    async fn delete_user_memories(&self, user_id: &str) -> Result<u64> {
        let t = self.t().clone();
        let mut conn = self.handle.write_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE id IN (SELECT id FROM {} WHERE user_id=?)",
                t.vectors, t.memories
            ),
            params![user_id],
        )?;
        tx.execute(
            &format!("DELETE FROM {} WHERE user_id=?", t.waypoints),
            params![user_id],
        )?;
        let removed = tx.execute(
            &format!("DELETE FROM {} WHERE user_id=?", t.memories),
            params![user_id],
        )?;
        tx.commit()?;
        Ok(removed as u64)
    }

    // ========== Waypoints ==========

    async fn upsert_waypoint(&self, wp: &Waypoint) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (src_id, dst_id, user_id, weight, created_at, updated_at) \
             VALUES (?,?,?,?,?,?) \
             ON CONFLICT(src_id, dst_id, user_id) DO UPDATE SET \
               weight=excluded.weight, updated_at=excluded.updated_at",
            self.t().waypoints
        );
        self.handle.write_conn()?.execute(
            &sql,
            params![
                wp.src_id,
                wp.dst_id,
                wp.user_id,
                wp.weight,
                wp.created_at,
                wp.updated_at
            ],
        )?;
        Ok(())
    }

    async fn waypoint(&self, src: &str, dst: &str) -> Result<Option<Waypoint>> {
        let conn = self.handle.read_conn()?;
        let sql = format!(
            "SELECT src_id, dst_id, user_id, weight, created_at, updated_at \
             FROM {} WHERE src_id=? AND dst_id=?",
            self.t().waypoints
        );
        let wp = conn
            .query_row(&sql, params![src, dst], |r| {
                Ok(Waypoint {
                    src_id: r.get(0)?,
                    dst_id: r.get(1)?,
                    user_id: r.get(2)?,
                    weight: r.get(3)?,
                    created_at: r.get(4)?,
                    updated_at: r.get(5)?,
                })
            })
            .optional()?;
        Ok(wp)
    }

    async fn neighbors(&self, src_ids: &[String], user_id: Option<&str>) -> Result<Vec<Waypoint>> {
        if src_ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.handle.read_conn()?;
        let mut sql = format!(
            "SELECT src_id, dst_id, user_id, weight, created_at, updated_at \
             FROM {} WHERE src_id IN ({})",
            self.t().waypoints,
            in_placeholders(src_ids.len())
        );
        let mut values: Vec<rusqlite::types::Value> = src_ids
            .iter()
            .map(|id| rusqlite::types::Value::from(id.clone()))
            .collect();
        if let Some(u) = user_id {
            sql.push_str(" AND user_id=?");
            values.push(u.to_string().into());
        }
        sql.push_str(" ORDER BY weight DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                Ok(Waypoint {
                    src_id: r.get(0)?,
                    dst_id: r.get(1)?,
                    user_id: r.get(2)?,
                    weight: r.get(3)?,
                    created_at: r.get(4)?,
                    updated_at: r.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
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
        let conn = self.handle.write_conn()?;
        let sql = format!(
            "UPDATE {} SET weight = MIN(?, weight + ?), updated_at=? \
             WHERE src_id=? AND dst_id=? AND user_id=?",
            self.t().waypoints
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        for pair in path.windows(2) {
            stmt.execute(params![cap, boost, now, pair[0], pair[1], user_id])?;
        }
        Ok(())
    }

    async fn prune_waypoints(&self, threshold: f64) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE weight < ?", self.t().waypoints);
        let n = self.handle.write_conn()?.execute(&sql, params![threshold])?;
        Ok(n as u64)
    }

    async fn delete_orphans(&self) -> Result<(u64, u64)> {
        let t = self.t().clone();
        let mut conn = self.handle.write_conn()?;
        let tx = conn.transaction()?;
        let vectors = tx.execute(
            &format!(
                "DELETE FROM {} WHERE id NOT IN (SELECT id FROM {})",
                t.vectors, t.memories
            ),
            [],
        )?;
        let waypoints = tx.execute(
            &format!(
                "DELETE FROM {} WHERE src_id NOT IN (SELECT id FROM {}) \
                 OR dst_id NOT IN (SELECT id FROM {})",
                t.waypoints, t.memories, t.memories
            ),
            [],
        )?;
        tx.commit()?;
        Ok((vectors as u64, waypoints as u64))
    }

    // ========== Classifier ==========

    async fn classifier_model(&self, user_id: &str) -> Result<Option<ClassifierModel>> {
        let conn = self.handle.read_conn()?;
        let sql = format!(
            "SELECT weights, biases, version, updated_at FROM {} WHERE user_id=?",
            self.t().learned_models
        );
        let row: Option<(String, String, i64, i64)> = conn
            .query_row(&sql, params![user_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .optional()?;
        match row {
            None => Ok(None),
            Some((weights, biases, version, updated_at)) => Ok(Some(ClassifierModel {
                weights: serde_json::from_str(&weights)
                    .map_err(|e| StorageError::CorruptRow(format!("model weights: {e}")))?,
                biases: serde_json::from_str(&biases)
                    .map_err(|e| StorageError::CorruptRow(format!("model biases: {e}")))?,
                version,
                updated_at,
            })),
        }
    }

    async fn put_classifier_model(&self, user_id: &str, model: &ClassifierModel) -> Result<()> {
        let weights = serde_json::to_string(&model.weights)
            .map_err(|e| StorageError::CorruptRow(e.to_string()))?;
        let biases = serde_json::to_string(&model.biases)
            .map_err(|e| StorageError::CorruptRow(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (user_id, weights, biases, version, updated_at) VALUES (?,?,?,?,?) \
             ON CONFLICT(user_id) DO UPDATE SET weights=excluded.weights, \
               biases=excluded.biases, version=excluded.version, updated_at=excluded.updated_at",
            self.t().learned_models
        );
        self.handle.write_conn()?.execute(
            &sql,
            params![user_id, weights, biases, model.version, model.updated_at],
        )?;
        Ok(())
    }

    async fn training_data(&self, user_id: &str, limit: i64) -> Result<Vec<(Vec<f32>, Sector)>> {
        let conn = self.handle.read_conn()?;
        let sql = format!(
            "SELECT mean_vec, primary_sector FROM {} \
             WHERE user_id=? AND mean_vec IS NOT NULL \
             ORDER BY created_at DESC LIMIT ?",
            self.t().memories
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id, limit], |r| {
                let buf: Vec<u8> = r.get(0)?;
                let sector: String = r.get(1)?;
                Ok((buf, sector))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(buf, sector)| {
                bytes_to_vec(&buf).map(|v| (v, Sector::parse_name(&sector)))
            })
            .collect())
    }

    // ========== Logs & stats ==========

    async fn insert_embed_log(&self, log: &EmbedLog) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, model, status, ts, err, user_id) VALUES (?,?,?,?,?,?)",
            self.t().embed_logs
        );
        self.handle.write_conn()?.execute(
            &sql,
            params![
                log.id,
                log.model,
                log.status.as_str(),
                log.ts,
                log.err,
                log.user_id
            ],
        )?;
        Ok(())
    }

    async fn update_embed_log(
        &self,
        id: &str,
        status: EmbedStatus,
        err: Option<&str>,
    ) -> Result<()> {
        let sql = format!("UPDATE {} SET status=?, err=? WHERE id=?", self.t().embed_logs);
        self.handle
            .write_conn()?
            .execute(&sql, params![status.as_str(), err, id])?;
        Ok(())
    }

    async fn embed_logs_by_status(
        &self,
        status: EmbedStatus,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<EmbedLog>> {
        let conn = self.handle.read_conn()?;
        let mut sql = format!(
            "SELECT id, model, status, ts, err, user_id FROM {} WHERE status=?",
            self.t().embed_logs
        );
        let mut values: Vec<rusqlite::types::Value> =
            vec![status.as_str().to_string().into()];
        if let Some(u) = user_id {
            sql.push_str(" AND user_id=?");
            values.push(u.to_string().into());
        }
        sql.push_str(" ORDER BY ts DESC LIMIT ?");
        values.push(limit.into());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                let status: String = r.get(2)?;
                Ok(EmbedLog {
                    id: r.get(0)?,
                    model: r.get(1)?,
                    status: match status.as_str() {
                        "completed" => EmbedStatus::Completed,
                        "failed" => EmbedStatus::Failed,
                        _ => EmbedStatus::Pending,
                    },
                    ts: r.get(3)?,
                    err: r.get(4)?,
                    user_id: r.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn append_stat(&self, kind: &str, count: i64, ts: i64) -> Result<()> {
        let sql = format!("INSERT INTO {} (type, count, ts) VALUES (?,?,?)", self.t().stats);
        self.handle.write_conn()?.execute(&sql, params![kind, count, ts])?;
        Ok(())
    }

    async fn sector_stats(&self, user_id: Option<&str>) -> Result<Vec<SectorStat>> {
        let conn = self.handle.read_conn()?;
        let rows = match user_id {
            Some(u) => {
                let sql = format!(
                    "SELECT primary_sector, COUNT(*), AVG(salience) FROM {} \
                     WHERE user_id=? GROUP BY primary_sector",
                    self.t().memories
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![u], |r| {
                    Ok(SectorStat {
                        sector: r.get(0)?,
                        count: r.get(1)?,
                        avg_salience: r.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT primary_sector, COUNT(*), AVG(salience) FROM {} \
                     GROUP BY primary_sector",
                    self.t().memories
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map([], |r| {
                    Ok(SectorStat {
                        sector: r.get(0)?,
                        count: r.get(1)?,
                        avg_salience: r.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    async fn delete_stats_before(&self, ts: i64) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE ts < ?", self.t().stats);
        let n = self.handle.write_conn()?.execute(&sql, params![ts])?;
        Ok(n as u64)
    }

    async fn append_maint_log(&self, log: &MaintLog) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, type, status, ts, details) VALUES (?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET status=excluded.status, details=excluded.details",
            self.t().maint_logs
        );
        self.handle.write_conn()?.execute(
            &sql,
            params![log.id, log.op, log.status, log.ts, log.details],
        )?;
        Ok(())
    }

    // ========== Users ==========

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let conn = self.handle.read_conn()?;
        let sql = format!(
            "SELECT id, summary, reflection_count, created_at, updated_at, metadata \
             FROM {} WHERE id=?",
            self.t().users
        );
        let profile = conn
            .query_row(&sql, params![user_id], |r| {
                Ok(UserProfile {
                    user_id: r.get(0)?,
                    summary: r.get(1)?,
                    reflection_count: r.get(2)?,
                    created_at: r.get(3)?,
                    updated_at: r.get(4)?,
                    metadata: r.get(5)?,
                })
            })
            .optional()?;
        Ok(profile)
    }

    async fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, summary, reflection_count, created_at, updated_at, metadata) \
             VALUES (?,?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET summary=excluded.summary, \
               reflection_count=excluded.reflection_count, updated_at=excluded.updated_at, \
               metadata=excluded.metadata",
            self.t().users
        );
        self.handle.write_conn()?.execute(
            &sql,
            params![
                profile.user_id,
                profile.summary,
                profile.reflection_count,
                profile.created_at,
                profile.updated_at,
                profile.metadata
            ],
        )?;
        Ok(())
    }

    async fn update_user_summary(&self, user_id: &str, summary: &str, updated: i64) -> Result<()> {
        let sql = format!("UPDATE {} SET summary=?, updated_at=? WHERE id=?", self.t().users);
        self.handle
            .write_conn()?
            .execute(&sql, params![summary, updated, user_id])?;
        Ok(())
    }

    async fn bump_reflection_count(&self, user_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET reflection_count = reflection_count + 1 WHERE id=?",
            self.t().users
        );
        self.handle.write_conn()?.execute(&sql, params![user_id])?;
        Ok(())
    }

    // ========== Maintenance ==========

    async fn rewrite_contents(&self, rows: &[(String, String)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let t = self.t().clone();
        let mut conn = self.handle.write_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached(&format!("UPDATE {} SET content=? WHERE id=?", t.memories))?;
            for (id, content) in rows {
                stmt.execute(params![content, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn optimize(&self) -> Result<()> {
        self.handle.write_conn()?.execute_batch("VACUUM")?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;

    fn test_storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let handle = SqliteHandle::open(Some(dir.path().join("test.db"))).unwrap();
        (dir, SqliteStorage::new(handle))
    }

    fn mem(id: &str, user: &str) -> MemoryRecord {
        let now = now_ms();
        MemoryRecord {
            id: id.into(),
            user_id: user.into(),
            segment: 0,
            content: format!("content of {id}"),
            simhash: "0123456789abcdef".into(),
            primary_sector: Sector::Semantic,
            tags: "[]".into(),
            metadata: "{}".into(),
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            salience: 0.5,
            decay_lambda: 0.005,
            version: 1,
            mean_dim: Some(4),
            mean_vec: Some(crate::vectors::vec_to_bytes(&[0.5, 0.5, 0.5, 0.5])),
            compressed_vec: None,
            feedback_score: 0.0,
            generated_summary: None,
        }
    }

    #[tokio::test]
    async fn test_memory_roundtrip_and_user_filter() {
        let (_dir, store) = test_storage();
        store.upsert_memory(&mem("m1", "u1")).await.unwrap();

        let got = store.memory("m1", None).await.unwrap().unwrap();
        assert_eq!(got.user_id, "u1");
        assert_eq!(got.primary_sector, Sector::Semantic);

        // Wrong user sees nothing
        assert!(store.memory("m1", Some("u2")).await.unwrap().is_none());
        assert!(store.memory("m1", Some("u1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_simhash_lookup_prefers_salience() {
        let (_dir, store) = test_storage();
        let mut a = mem("a", "u1");
        a.salience = 0.3;
        let mut b = mem("b", "u1");
        b.salience = 0.9;
        store.upsert_memory(&a).await.unwrap();
        store.upsert_memory(&b).await.unwrap();

        let hit = store
            .memory_by_simhash("0123456789abcdef", Some("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, "b");
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let (_dir, store) = test_storage();
        store.upsert_memory(&mem("m1", "u1")).await.unwrap();
        store.upsert_memory(&mem("m2", "u1")).await.unwrap();
        let now = now_ms();
        store
            .upsert_waypoint(&Waypoint {
                src_id: "m1".into(),
                dst_id: "m2".into(),
                user_id: "u1".into(),
                weight: 0.5,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        assert!(store.delete_memory("m1", None).await.unwrap());
        assert!(store.memory("m1", None).await.unwrap().is_none());
        assert!(store.waypoint("m1", "m2").await.unwrap().is_none());
        // Missing row reports false
        assert!(!store.delete_memory("m1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_segments() {
        let (_dir, store) = test_storage();
        let mut a = mem("a", "u1");
        a.segment = 0;
        let mut b = mem("b", "u1");
        b.segment = 2;
        store.upsert_memory(&a).await.unwrap();
        store.upsert_memory(&b).await.unwrap();

        assert_eq!(store.max_segment(Some("u1")).await.unwrap(), 2);
        assert_eq!(store.segment_count(0, Some("u1")).await.unwrap(), 1);
        assert_eq!(store.segments().await.unwrap(), vec![2, 0]);
    }

    #[tokio::test]
    async fn test_waypoint_upsert_and_bump() {
        let (_dir, store) = test_storage();
        let now = now_ms();
        let wp = Waypoint {
            src_id: "a".into(),
            dst_id: "b".into(),
            user_id: "u1".into(),
            weight: 0.4,
            created_at: now,
            updated_at: now,
        };
        store.upsert_waypoint(&wp).await.unwrap();
        store
            .bump_waypoints(&["a".into(), "b".into()], 0.05, 1.0, "u1", now)
            .await
            .unwrap();
        let got = store.waypoint("a", "b").await.unwrap().unwrap();
        assert!((got.weight - 0.45).abs() < 1e-9);

        // Cap respected
        store
            .bump_waypoints(&["a".into(), "b".into()], 5.0, 1.0, "u1", now)
            .await
            .unwrap();
        let got = store.waypoint("a", "b").await.unwrap().unwrap();
        assert!(got.weight <= 1.0);
    }

    #[tokio::test]
    async fn test_mark_consolidated_and_scale() {
        let (_dir, store) = test_storage();
        store.upsert_memory(&mem("m1", "u1")).await.unwrap();
        store
            .mark_consolidated(&["m1".into()], now_ms())
            .await
            .unwrap();
        let got = store.memory("m1", None).await.unwrap().unwrap();
        assert!(got.is_consolidated());

        store.scale_salience(&["m1".into()], 1.1, now_ms()).await.unwrap();
        let got = store.memory("m1", None).await.unwrap().unwrap();
        assert!((got.salience - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_classifier_model_roundtrip() {
        let (_dir, store) = test_storage();
        let mut weights = std::collections::HashMap::new();
        weights.insert("semantic".to_string(), vec![0.1f32, 0.2]);
        let model = ClassifierModel {
            weights,
            biases: std::collections::HashMap::new(),
            version: 2,
            updated_at: now_ms(),
        };
        store.put_classifier_model("u1", &model).await.unwrap();
        let got = store.classifier_model("u1").await.unwrap().unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(got.weights["semantic"], vec![0.1, 0.2]);
        assert!(store.classifier_model("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_cleanup() {
        let (_dir, store) = test_storage();
        store.upsert_memory(&mem("live", "u1")).await.unwrap();
        let now = now_ms();
        store
            .upsert_waypoint(&Waypoint {
                src_id: "ghost".into(),
                dst_id: "live".into(),
                user_id: "u1".into(),
                weight: 0.2,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let (_v, w) = store.delete_orphans().await.unwrap();
        assert_eq!(w, 1);
    }

    #[tokio::test]
    async fn test_prune_waypoints() {
        let (_dir, store) = test_storage();
        let now = now_ms();
        for (src, dst, weight) in [("a", "b", 0.05), ("b", "c", 0.5)] {
            store
                .upsert_waypoint(&Waypoint {
                    src_id: src.into(),
                    dst_id: dst.into(),
                    user_id: "u1".into(),
                    weight,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        let pruned = store.prune_waypoints(0.1).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(store.waypoint("a", "b").await.unwrap().is_none());
        assert!(store.waypoint("b", "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_embed_log_lifecycle() {
        let (_dir, store) = test_storage();
        store
            .insert_embed_log(&EmbedLog {
                id: "m1".into(),
                model: "multi-sector".into(),
                status: EmbedStatus::Pending,
                ts: now_ms(),
                err: None,
                user_id: Some("u1".into()),
            })
            .await
            .unwrap();
        assert_eq!(
            store
                .embed_logs_by_status(EmbedStatus::Pending, Some("u1"), 10)
                .await
                .unwrap()
                .len(),
            1
        );

        store
            .update_embed_log("m1", EmbedStatus::Completed, None)
            .await
            .unwrap();
        assert!(store
            .embed_logs_by_status(EmbedStatus::Pending, Some("u1"), 10)
            .await
            .unwrap()
            .is_empty());
        let done = store
            .embed_logs_by_status(EmbedStatus::Completed, None, 10)
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].model, "multi-sector");
    }

    #[tokio::test]
    async fn test_stats_retention() {
        let (_dir, store) = test_storage();
        store.append_stat("reflect", 1, 1000).await.unwrap();
        store.append_stat("reflect", 1, now_ms()).await.unwrap();
        let removed = store.delete_stats_before(2000).await.unwrap();
        assert_eq!(removed, 1);
    }
}
