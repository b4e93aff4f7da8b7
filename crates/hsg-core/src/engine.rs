//! The engine handle
//!
//! `Engine` owns every dependency — storage, vector store, provider chain,
//! encryption, caches, counters — and exposes the memory API: add, search,
//! get, update, reinforce, delete, history, stats, key rotation, plus the
//! background loops (decay, reflection, maintenance). There are no globals;
//! tests construct engines with injected doubles.

use crate::classifier::{ClassifierCache, Prediction};
use crate::config::{BackendKind, Config};
use crate::crypto::{CryptoError, Encryption};
use crate::decay;
use crate::dynamics::{Reinforcement, ScoringWeights};
use crate::embedding::{EmbeddingProvider, FailoverChain, ProviderError};
use crate::hsg::ingest::{self, IngestOptions};
use crate::hsg::query;
use crate::maintenance;
use crate::reflect;
use crate::storage::sqlite::{SqliteHandle, SqliteStorage};
use crate::storage::{Storage, StorageError};
use crate::summary;
use crate::types::{
    now_ms, IngestOutcome, IngestRequest, MemoryItem, SearchFilters, SectorStat,
};
use crate::vector_store::sqlite::SqliteVectorStore;
use crate::vector_store::VectorStore;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

/// Query cache capacity (entries)
const QUERY_CACHE_CAPACITY: usize = 1000;
/// Page size used when walking a user's rows for key rotation
const ROTATE_PAGE: i64 = 500;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Top-level engine error. Per-module errors convert in; the API boundary
/// maps `NotFound`/`AuthDenied` to its own status codes.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Requested memory missing or owned by another user
    #[error("Not found")]
    NotFound,
    /// Ownership mismatch on a mutating operation
    #[error("Access denied")]
    AuthDenied,
    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),
    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Provider failure that survived failover
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Encryption failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Configuration failure at startup
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// ENGINE
// ============================================================================

/// Aggregate stats returned by `Engine::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_memories: i64,
    pub user_count: usize,
    pub sectors: Vec<SectorStat>,
    pub backend: &'static str,
}

/// Result of a key-rotation pass.
#[derive(Debug, Clone, Serialize)]
pub struct RotateOutcome {
    pub success: bool,
    pub rotated_count: u64,
}

pub struct Engine {
    cfg: Config,
    store: Arc<dyn Storage>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<FailoverChain>,
    encryption: Arc<Encryption>,
    scoring: ScoringWeights,
    reinforcement: Reinforcement,
    classifier_cache: ClassifierCache,

    query_cache: Mutex<LruCache<String, (Vec<MemoryItem>, i64)>>,
    coact_buffer: Mutex<Vec<(String, String, String)>>,
    active_queries: AtomicI64,
    last_decay: AtomicI64,
    write_gate: tokio::sync::Mutex<()>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<Engine>,
}

impl Engine {
    /// Open an engine from layered configuration (`hsg.toml` + `HSG_*` env).
    pub async fn open_default() -> Result<Arc<Self>> {
        Self::open(Config::load()?).await
    }

    /// Open an engine against the backend implied by `db_url`.
    pub async fn open(cfg: Config) -> Result<Arc<Self>> {
        let (store, vectors): (Arc<dyn Storage>, Arc<dyn VectorStore>) = match cfg.backend() {
            BackendKind::Sqlite => {
                let handle = SqliteHandle::open(cfg.sqlite_path())?;
                (
                    Arc::new(SqliteStorage::new(handle.clone())),
                    Arc::new(SqliteVectorStore::new(handle)),
                )
            }
            #[cfg(feature = "postgres")]
            BackendKind::Postgres => {
                let handle = crate::storage::postgres::PgHandle::connect(
                    &cfg.db_url,
                    &cfg.pg_schema,
                    &cfg.pg_table,
                )
                .await?;
                (
                    Arc::new(crate::storage::postgres::PostgresStorage::new(handle.clone())),
                    Arc::new(crate::vector_store::postgres::PostgresVectorStore::new(handle)),
                )
            }
            #[cfg(not(feature = "postgres"))]
            BackendKind::Postgres => {
                return Err(EngineError::Validation(
                    "postgres backend requested but the 'postgres' feature is disabled".into(),
                ));
            }
        };

        Ok(Self::assemble(cfg, store, vectors))
    }

    /// Wire an engine from explicit parts. Tests use this to inject doubles.
    pub fn assemble(
        cfg: Config,
        store: Arc<dyn Storage>,
        vectors: Arc<dyn VectorStore>,
    ) -> Arc<Self> {
        let embedder = Arc::new(FailoverChain::from_config(&cfg));
        let encryption = Arc::new(Encryption::from_config(
            cfg.encryption_enabled,
            cfg.encryption_key.as_deref(),
            &cfg.encryption_secondary_keys,
        ));
        let scoring = ScoringWeights::from_config(&cfg);
        let reinforcement = Reinforcement::from_config(&cfg);

        if cfg.verbose {
            tracing::info!(
                "[engine] tier={:?} vec_dim={} emb={} fallback={:?} encryption={}",
                cfg.tier,
                cfg.vec_dim,
                cfg.emb_kind,
                cfg.embedding_fallback,
                encryption.enabled()
            );
        }

        Arc::new_cyclic(|weak| Engine {
            cfg,
            store,
            vectors,
            embedder,
            encryption,
            scoring,
            reinforcement,
            classifier_cache: ClassifierCache::new(),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
            coact_buffer: Mutex::new(Vec::new()),
            active_queries: AtomicI64::new(0),
            last_decay: AtomicI64::new(0),
            write_gate: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            self_ref: weak.clone(),
        })
    }

    // ========== Component accessors (crate-internal plumbing) ==========

    pub(crate) fn config(&self) -> &Config {
        &self.cfg
    }

    pub(crate) fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub(crate) fn vectors(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    pub(crate) fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    pub(crate) fn encryption(&self) -> &Encryption {
        &self.encryption
    }

    pub(crate) fn scoring(&self) -> &ScoringWeights {
        &self.scoring
    }

    pub(crate) fn reinforcement(&self) -> &Reinforcement {
        &self.reinforcement
    }

    pub(crate) fn classifier_cache(&self) -> &ClassifierCache {
        &self.classifier_cache
    }

    pub(crate) fn write_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.write_gate
    }

    pub(crate) fn active_queries(&self) -> &AtomicI64 {
        &self.active_queries
    }

    pub(crate) fn last_decay(&self) -> &AtomicI64 {
        &self.last_decay
    }

    /// Load the user's learned model (cached) and return its prediction when
    /// the posterior clears `threshold`.
    pub(crate) async fn learned_refine(
        &self,
        user_id: &str,
        mean_vec: &[f32],
        threshold: f64,
    ) -> Option<Prediction> {
        let model = match self.classifier_cache.get(user_id) {
            Some(m) => m,
            None => {
                let m = self.store.classifier_model(user_id).await.ok().flatten()?;
                self.classifier_cache.put(user_id, m.clone());
                m
            }
        };
        let prediction = crate::classifier::predict(mean_vec, &model);
        (prediction.confidence > threshold).then_some(prediction)
    }

    pub(crate) fn cached_query(&self, key: &str, ttl_ms: i64) -> Option<Vec<MemoryItem>> {
        let mut cache = self.query_cache.lock().ok()?;
        match cache.get(key) {
            Some((items, ts)) if now_ms() - *ts < ttl_ms => Some(items.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn cache_query(&self, key: &str, items: Vec<MemoryItem>) {
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(key.to_string(), (items, now_ms()));
        }
    }

    /// Drop all cached query results (tests, post-mutation invalidation)
    pub fn clear_query_cache(&self) {
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.clear();
        }
    }

    pub(crate) fn record_coactivation(&self, user_id: &str, a: &str, b: &str) {
        if let Ok(mut buf) = self.coact_buffer.lock() {
            buf.push((user_id.to_string(), a.to_string(), b.to_string()));
        }
    }

    pub(crate) fn take_coactivation_batch(&self, n: usize) -> Vec<(String, String, String)> {
        match self.coact_buffer.lock() {
            Ok(mut buf) => {
                let take = n.min(buf.len());
                buf.drain(..take).collect()
            }
            Err(_) => vec![],
        }
    }

    /// Fire the co-activation drain as a detached task.
    pub(crate) fn spawn_coactivation_worker(&self) {
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = query::drain_coactivations(&engine).await {
                tracing::warn!("[hsg] coactivation worker failed: {e}");
            }
        });
    }

    /// Schedule a non-blocking refresh of the user's profile summary.
    pub(crate) fn schedule_summary_refresh(&self, user_id: &str) {
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = summary::update_user_summary(&engine, &user_id).await {
                tracing::error!("[summary] background refresh failed for {user_id}: {e}");
            }
        });
    }

    // ========================================================================
    // MEMORY API
    // ========================================================================

    /// Ingest content for a user. Deduplication against a near-identical
    /// existing memory is a normal outcome, reported in the result.
    pub async fn add(
        &self,
        content: &str,
        user_id: Option<&str>,
        tags: &[String],
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<IngestOutcome> {
        ingest::add_memory(self, content, tags, &metadata, user_id, IngestOptions::default()).await
    }

    /// High-throughput batch ingestion.
    pub async fn add_batch(
        &self,
        items: &[IngestRequest],
        user_id: Option<&str>,
    ) -> Result<Vec<IngestOutcome>> {
        ingest::add_memories(self, items, user_id).await
    }

    /// Restore-path ingest with explicit id and creation time; skips dedup
    /// when the id matches an existing row.
    pub async fn import(
        &self,
        content: &str,
        user_id: Option<&str>,
        tags: &[String],
        metadata: serde_json::Map<String, serde_json::Value>,
        id: Option<String>,
        created_at: Option<i64>,
    ) -> Result<IngestOutcome> {
        ingest::add_memory(
            self,
            content,
            tags,
            &metadata,
            user_id,
            IngestOptions {
                id_override: id,
                created_at_override: created_at,
            },
        )
        .await
    }

    /// Fetch one memory, decrypted. With `user_id` set, rows owned by a
    /// different user come back as None rather than an error.
    pub async fn get(&self, id: &str, user_id: Option<&str>) -> Result<Option<MemoryItem>> {
        let Some(rec) = self.store.memory(id, None).await? else {
            return Ok(None);
        };
        if let Some(uid) = user_id {
            if !rec.user_id.is_empty() && rec.user_id != uid {
                return Ok(None);
            }
        }
        let content = self.encryption.decrypt(&rec.content)?;
        Ok(Some(MemoryItem::from_record(&rec, content)))
    }

    /// Hybrid retrieval. See the query module for the pipeline.
    pub async fn search(
        &self,
        query_text: &str,
        k: usize,
        filters: SearchFilters,
    ) -> Result<Vec<MemoryItem>> {
        query::search(self, query_text, k, &filters).await
    }

    /// Update content, tags, and/or metadata of an owned memory. New content
    /// is reclassified and re-embedded; the version increments.
    pub async fn update(
        &self,
        id: &str,
        content: Option<&str>,
        tags: Option<&[String]>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
        user_id: Option<&str>,
    ) -> Result<MemoryItem> {
        let mut rec = self.store.memory(id, None).await?.ok_or(EngineError::NotFound)?;
        if let Some(uid) = user_id {
            if !rec.user_id.is_empty() && rec.user_id != uid {
                return Err(EngineError::AuthDenied);
            }
        }

        let now = now_ms();
        if let Some(tags) = tags {
            rec.tags = serde_json::to_string(tags).unwrap_or_else(|_| "[]".into());
        }
        if let Some(meta) = metadata {
            rec.metadata = serde_json::Value::Object(meta).to_string();
        }

        if let Some(new_content) = content {
            let cls = crate::classifier::classify_content(new_content, Some(&rec.metadata_map()));
            let mut sectors = vec![cls.primary];
            for s in &cls.additional {
                if !sectors.contains(s) {
                    sectors.push(*s);
                }
            }
            let embeddings =
                crate::hsg::embed::embed_multi_sector(self, id, new_content, &sectors, user_id)
                    .await?;
            let mean = crate::embedding::fused_mean(&embeddings);

            let stored = if self.cfg.use_summary_only {
                crate::text::extract_essence(new_content, self.cfg.summary_max_length)
            } else {
                new_content.to_string()
            };
            rec.content = self.encryption.encrypt(&stored)?;
            rec.simhash = crate::text::compute_simhash(new_content);
            rec.primary_sector = cls.primary;
            rec.decay_lambda = self.cfg.sector_lambda(cls.primary);
            rec.mean_dim = Some(mean.len() as i64);
            rec.mean_vec = Some(crate::vectors::vec_to_bytes(&mean));

            let owner = rec.user_id.clone();
            self.vectors.delete_vectors(id, None).await?;
            let rows: Vec<crate::types::VectorRecord> = embeddings
                .iter()
                .map(|(sector, vec)| {
                    crate::types::VectorRecord::new(id, sector.as_str(), vec.clone())
                        .with_user(owner.clone())
                })
                .collect();
            self.vectors.store_vectors(&rows).await?;
        }

        rec.updated_at = now;
        rec.version += 1;
        self.store.upsert_memory(&rec).await?;
        self.clear_query_cache();

        self.get(id, user_id).await?.ok_or(EngineError::NotFound)
    }

    /// Manually reinforce a memory's salience and propagate a share to its
    /// direct neighbors.
    pub async fn reinforce(&self, id: &str, boost: f64, user_id: Option<&str>) -> Result<f64> {
        let rec = self.store.memory(id, user_id).await?.ok_or(EngineError::NotFound)?;
        let now = now_ms();
        let new_salience = (rec.salience + boost).min(self.reinforcement.max_salience);
        self.store
            .touch_memory(id, now, new_salience, now, user_id)
            .await?;

        let edges = self.store.neighbors(&[id.to_string()], user_id).await?;
        if !edges.is_empty() {
            let neighbor_ids: Vec<String> = edges.iter().map(|e| e.dst_id.clone()).collect();
            let rows = self.store.memories_by_ids(&neighbor_ids, user_id).await?;
            let by_id: std::collections::HashMap<&str, f64> =
                rows.iter().map(|m| (m.id.as_str(), m.salience)).collect();
            let inputs: Vec<(String, f64, f64)> = edges
                .iter()
                .filter_map(|e| {
                    by_id
                        .get(e.dst_id.as_str())
                        .map(|s| (e.dst_id.clone(), e.weight, *s))
                })
                .collect();
            let updates = crate::dynamics::propagate_reinforcement(new_salience, &inputs);
            let batch: Vec<(f64, i64, String)> = updates
                .into_iter()
                .map(|(nid, sal)| (sal, now, nid))
                .collect();
            self.store.update_salience_batch(&batch).await?;
        }

        decay::on_query_hit(self, id, rec.primary_sector, user_id, true).await?;
        Ok(new_salience)
    }

    /// Delete one memory with its vectors and waypoints. NotFound when the
    /// id does not exist (or belongs to someone else under `user_id`).
    /// The write gate keeps the cascade from overlapping an ingest
    /// transaction on the embedded backend.
    pub async fn delete(&self, id: &str, user_id: Option<&str>) -> Result<()> {
        let _write = self.write_gate.lock().await;
        if self.store.delete_memory(id, user_id).await? {
            self.clear_query_cache();
            Ok(())
        } else {
            Err(EngineError::NotFound)
        }
    }

    /// Delete everything a user owns. Returns the number of memories removed.
    pub async fn delete_all(&self, user_id: &str) -> Result<u64> {
        let _write = self.write_gate.lock().await;
        let removed = self.store.delete_user_memories(user_id).await?;
        self.clear_query_cache();
        Ok(removed)
    }

    /// A user's memories, newest first, decrypted. Undecryptable rows are
    /// skipped with a log line.
    pub async fn history(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MemoryItem>> {
        let rows = self
            .store
            .recent_memories(limit, offset, Some(user_id))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|rec| match self.encryption.decrypt(&rec.content) {
                Ok(content) => Some(MemoryItem::from_record(rec, content)),
                Err(e) => {
                    tracing::warn!("[engine] skipping {} in history: {e}", rec.id);
                    None
                }
            })
            .collect())
    }

    /// Distinct user ids with stored memories.
    pub async fn list_users(&self) -> Result<Vec<String>> {
        Ok(self.store.list_users().await?)
    }

    /// Memories of one sector, newest first, decrypted.
    pub async fn by_sector(
        &self,
        sector: crate::types::Sector,
        limit: i64,
        offset: i64,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>> {
        let rows = self
            .store
            .memories_by_sector(sector, limit, offset, user_id)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|rec| match self.encryption.decrypt(&rec.content) {
                Ok(content) => Some(MemoryItem::from_record(rec, content)),
                Err(e) => {
                    tracing::warn!("[engine] skipping {} in sector listing: {e}", rec.id);
                    None
                }
            })
            .collect())
    }

    /// Embed-log rows in a given state, for observability tooling.
    pub async fn embed_logs(
        &self,
        status: crate::types::EmbedStatus,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<crate::types::EmbedLog>> {
        Ok(self.store.embed_logs_by_status(status, user_id, limit).await?)
    }

    /// Drop waypoints below a weight threshold. Explicit operator surface;
    /// nothing calls this automatically because fresh co-activation edges
    /// start near the default threshold.
    pub async fn prune_waypoints(&self, threshold: f64) -> Result<u64> {
        Ok(self.store.prune_waypoints(threshold).await?)
    }

    /// Aggregate statistics, optionally scoped to one user.
    pub async fn stats(&self, user_id: Option<&str>) -> Result<EngineStats> {
        let sectors = self.store.sector_stats(user_id).await?;
        let total = sectors.iter().map(|s| s.count).sum();
        let user_count = if user_id.is_some() {
            1
        } else {
            self.store.list_users().await?.len()
        };
        Ok(EngineStats {
            total_memories: total,
            user_count,
            sectors,
            backend: self.store.backend(),
        })
    }

    /// Re-encrypt stored content under the current primary key. Walks one
    /// user (or every user), one transaction per user. After this, no
    /// secondary key is needed to read the rows.
    pub async fn rotate_key(&self, user_id: Option<&str>) -> Result<RotateOutcome> {
        if !self.encryption.enabled() {
            return Err(EngineError::Validation(
                "key rotation requires encryption to be enabled".into(),
            ));
        }

        let users: Vec<String> = match user_id {
            Some(u) => vec![u.to_string()],
            None => self.store.list_users().await?,
        };

        let mut rotated = 0u64;
        for user in &users {
            let mut rewrites: Vec<(String, String)> = Vec::new();
            let mut offset = 0i64;
            loop {
                let page = self
                    .store
                    .recent_memories(ROTATE_PAGE, offset, Some(user))
                    .await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len() as i64;
                for rec in &page {
                    match self.encryption.re_encrypt(&rec.content) {
                        Ok(fresh) => rewrites.push((rec.id.clone(), fresh)),
                        Err(e) => {
                            tracing::warn!("[engine] rotate skipped {}: {e}", rec.id);
                        }
                    }
                }
            }
            rotated += rewrites.len() as u64;
            let _write = self.write_gate.lock().await;
            self.store.rewrite_contents(&rewrites).await?;
        }

        self.clear_query_cache();
        Ok(RotateOutcome {
            success: true,
            rotated_count: rotated,
        })
    }

    // ========================================================================
    // BACKGROUND LOOPS
    // ========================================================================

    /// Run one decay cycle now (also used by the loop). Returns None when
    /// the cycle deferred to active queries or the cooldown.
    pub async fn run_decay_once(&self) -> Result<Option<decay::DecayStats>> {
        decay::run_decay_cycle(self).await
    }

    /// Run one reflection pass for a user now.
    pub async fn run_reflection_once(
        &self,
        user_id: Option<&str>,
    ) -> Result<reflect::ReflectionOutcome> {
        reflect::run_reflection(self, user_id).await
    }

    /// Run one maintenance cycle now.
    pub async fn run_maintenance_once(self: &Arc<Self>) -> Result<()> {
        maintenance::run_maintenance_cycle(self).await
    }

    /// Start the decay / reflection / maintenance loops. Each iteration is
    /// wrapped so an error logs and the loop sleeps to the next tick.
    pub fn start_background(self: &Arc<Self>) {
        let mut handles = Vec::new();

        let engine = self.clone();
        let decay_period = std::time::Duration::from_secs(engine.cfg.decay_interval * 60);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(decay_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(e) = decay::run_decay_cycle(&engine).await {
                    tracing::error!("[decay] cycle error: {e}");
                }
            }
        }));

        if self.cfg.auto_reflect {
            let engine = self.clone();
            let reflect_period = std::time::Duration::from_secs(engine.cfg.reflect_interval * 60);
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(reflect_period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    let users = match engine.store.list_users().await {
                        Ok(u) => u,
                        Err(e) => {
                            tracing::error!("[reflect] user listing failed: {e}");
                            continue;
                        }
                    };
                    if users.is_empty() {
                        if let Err(e) = reflect::run_reflection(&engine, None).await {
                            tracing::error!("[reflect] pass error: {e}");
                        }
                        continue;
                    }
                    for user in users {
                        if let Err(e) = reflect::run_reflection(&engine, Some(&user)).await {
                            tracing::error!("[reflect] pass error for {user}: {e}");
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }));
        }

        let engine = self.clone();
        let maint_period =
            std::time::Duration::from_secs(engine.cfg.maintenance_interval_hours * 3600);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(maint_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup stays quick
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = maintenance::run_maintenance_cycle(&engine).await {
                    tracing::error!("[maintenance] cycle error: {e}");
                }
            }
        }));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        tracing::info!(
            "[engine] background loops started (decay {}m, reflect {}m, maintenance {}h)",
            self.cfg.decay_interval,
            self.cfg.reflect_interval,
            self.cfg.maintenance_interval_hours
        );
    }

    /// Stop background loops and disconnect the vector store.
    pub async fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Err(e) = self.vectors.disconnect().await {
            tracing::warn!("[engine] vector store disconnect failed: {e}");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_config(dir: &std::path::Path) -> Config {
        Config {
            db_url: format!("sqlite://{}", dir.join("engine.db").display()),
            vec_dim: 64,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_and_empty_stats() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).await.unwrap();
        let stats = engine.stats(None).await.unwrap();
        assert_eq!(stats.total_memories, 0);
        assert_eq!(stats.backend, "sqlite");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).await.unwrap();
        assert!(engine.get("nope", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).await.unwrap();
        assert!(matches!(
            engine.delete("nope", None).await,
            Err(EngineError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_query_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).await.unwrap();
        engine.cache_query("key", vec![]);
        assert!(engine.cached_query("key", 60_000).is_some());
        engine.clear_query_cache();
        assert!(engine.cached_query("key", 60_000).is_none());
    }

    #[tokio::test]
    async fn test_coactivation_buffer_drains_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).await.unwrap();
        for i in 0..70 {
            engine.record_coactivation("u", &format!("a{i}"), &format!("b{i}"));
        }
        assert_eq!(engine.take_coactivation_batch(50).len(), 50);
        assert_eq!(engine.take_coactivation_batch(50).len(), 20);
        assert!(engine.take_coactivation_batch(50).is_empty());
    }
}
