//! Ingestion pipeline
//!
//! Dedup by simhash, classify, embed per sector, fuse the mean vector, pick a
//! segment, encrypt, insert, then link the new memory into the waypoint graph
//! (semantic-gravity edge plus high-similarity inter-memory pairs). Batch
//! ingest shares the steps but embeds sector-grouped batches.

use super::embed::{embed_batch_multi_sector, embed_multi_sector};
use crate::classifier::{self, Classification};
use crate::config::Tier;
use crate::dynamics::params;
use crate::embedding::{fused_mean, EmbeddingProvider};
use crate::engine::{Engine, Result};
use crate::storage::Storage as _;
use crate::text::{compute_simhash, extract_essence, hamming_distance};
use crate::vector_store::VectorStore as _;
use crate::types::{
    now_ms, IngestOutcome, IngestRequest, MemoryRecord, Sector, UserProfile, VectorRecord,
    Waypoint,
};
use crate::vectors::{bytes_to_vec, compress_to_dim, cosine_similarity, vec_to_bytes};
use uuid::Uuid;

/// Bound on the semantic-gravity predecessor scan
const GRAVITY_SCAN_LIMIT: i64 = 250;
/// Bound on the inter-memory similarity scan
const INTER_MEM_SCAN_LIMIT: usize = 100;
/// Cosine threshold for bi-directional inter-memory links
const INTER_MEM_THRESHOLD: f32 = 0.85;
/// Weight given to inter-memory links
const INTER_MEM_WEIGHT: f64 = 0.5;
/// Compressed mean copy target dim in tier=smart
const SMART_COMPRESS_DIM: usize = 128;

/// Restore-path overrides; normal ingestion leaves both unset.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub id_override: Option<String>,
    pub created_at_override: Option<i64>,
}

fn effective_user(user_id: Option<&str>) -> String {
    user_id.unwrap_or("anonymous").to_string()
}

/// Ingest one memory. See the module docs for the pipeline; dedup is a
/// normal success variant, not an error.
pub async fn add_memory(
    engine: &Engine,
    content: &str,
    tags: &[String],
    metadata: &serde_json::Map<String, serde_json::Value>,
    user_id: Option<&str>,
    opts: IngestOptions,
) -> Result<IngestOutcome> {
    add_memory_inner(engine, content, tags, metadata, user_id, opts, true).await
}

/// The pipeline body. With `own_txn` the write gate and a transaction wrap
/// the mutation phase; reflection passes false because it already holds both
/// for its whole pass.
pub(crate) async fn add_memory_inner(
    engine: &Engine,
    content: &str,
    tags: &[String],
    metadata: &serde_json::Map<String, serde_json::Value>,
    user_id: Option<&str>,
    opts: IngestOptions,
    own_txn: bool,
) -> Result<IngestOutcome> {
    if content.trim().is_empty() {
        return Err(crate::engine::EngineError::Validation(
            "content must not be empty".into(),
        ));
    }

    let simhash = compute_simhash(content);

    // Near-duplicate short-circuit: boost the survivor and return it
    if opts.id_override.is_none() {
        if let Some(existing) = engine.store().memory_by_simhash(&simhash, user_id).await? {
            if hamming_distance(&simhash, &existing.simhash) <= params::HAMMING_THRESHOLD {
                let now = now_ms();
                let boosted = (existing.salience + params::DEDUP_BOOST).min(1.0);
                engine
                    .store()
                    .touch_memory(&existing.id, now, boosted, now, user_id)
                    .await?;
                return Ok(IngestOutcome::Deduplicated {
                    id: existing.id,
                    primary_sector: existing.primary_sector,
                    salience: boosted,
                    created_at: existing.created_at,
                });
            }
        }
    }

    let mid = opts
        .id_override
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let now_ts = opts.created_at_override.unwrap_or_else(now_ms);

    let mut cls = classifier::classify_content(content, Some(metadata));
    let chunks = crate::text::chunk_text(content, 768, 0.1);

    let mut all_sectors: Vec<Sector> = vec![cls.primary];
    for s in &cls.additional {
        if !all_sectors.contains(s) {
            all_sectors.push(*s);
        }
    }

    // Per-sector embeddings and the fused mean
    let mut embeddings =
        embed_multi_sector(engine, &mid, content, &all_sectors, user_id).await?;
    let mut mean_vec = fused_mean(&embeddings);

    // Learned refinement may move the primary; a brand-new sector must be
    // embedded before the mean is recomputed
    if let Some(uid) = user_id {
        if let Some(refined) = engine.learned_refine(uid, &mean_vec, 0.4).await {
            if !cls.forced && refined.primary != cls.primary {
                tracing::info!(
                    "[hsg] learned refinement for {uid}: {} -> {}",
                    cls.primary,
                    refined.primary
                );
                if !all_sectors.contains(&refined.primary) {
                    let vec = engine
                        .embedder()
                        .embed(content, Some(refined.primary))
                        .await
                        .map_err(crate::engine::EngineError::from)?;
                    embeddings.push((refined.primary, vec));
                    all_sectors.push(refined.primary);
                    mean_vec = fused_mean(&embeddings);
                }
                cls.primary = refined.primary;
            }
            for s in refined.additional {
                if s != cls.primary && !cls.additional.contains(&s) {
                    cls.additional.push(s);
                }
            }
        }
    }

    let record = build_record(
        engine, &mid, content, &simhash, &cls, tags, metadata, &mean_vec, now_ts, user_id,
    )
    .await?;
    let init_salience = record.salience;

    // Row + vectors + graph links commit together
    let write_guard = if own_txn {
        let guard = engine.write_gate().lock().await;
        engine.store().begin().await?;
        Some(guard)
    } else {
        None
    };

    let outcome: Result<()> = async {
        engine.store().upsert_memory(&record).await?;

        let owner = effective_user(user_id);
        let vec_rows: Vec<VectorRecord> = embeddings
            .iter()
            .map(|(sector, vec)| {
                VectorRecord::new(mid.clone(), sector.as_str(), vec.clone()).with_user(owner.clone())
            })
            .collect();
        engine.vectors().store_vectors(&vec_rows).await?;

        link_memory(engine, &mid, &mean_vec, cls.primary, &owner, now_ts).await?;
        Ok(())
    }
    .await;

    if own_txn {
        match &outcome {
            Ok(()) => engine.store().commit().await?,
            Err(_) => engine.store().rollback().await?,
        }
    }
    outcome?;
    drop(write_guard);

    // Summary refresh is best-effort and must not ride inside a caller's
    // transaction (reflection passes own_txn=false)
    if own_txn {
        if let Some(uid) = user_id {
            engine.schedule_summary_refresh(uid);
        }
    }

    Ok(IngestOutcome::Stored {
        id: mid,
        primary_sector: cls.primary,
        sectors: all_sectors,
        salience: init_salience,
        created_at: now_ts,
        simhash,
        chunks: chunks.len(),
    })
}

/// Build the memory row: essence, encryption, segment, initial salience.
#[allow(clippy::too_many_arguments)]
async fn build_record(
    engine: &Engine,
    mid: &str,
    content: &str,
    simhash: &str,
    cls: &Classification,
    tags: &[String],
    metadata: &serde_json::Map<String, serde_json::Value>,
    mean_vec: &[f32],
    now_ts: i64,
    user_id: Option<&str>,
) -> Result<MemoryRecord> {
    let cfg = engine.config();

    if let Some(uid) = user_id {
        ensure_user_profile(engine, uid, now_ts).await?;
    }

    // Segment rotation: stay in the user's max segment until it fills
    let mut segment = engine.store().max_segment(user_id).await?;
    let count = engine.store().segment_count(segment, user_id).await?;
    if count >= cfg.seg_size {
        segment += 1;
    }

    let stored_content = if cfg.use_summary_only {
        extract_essence(content, cfg.summary_max_length)
    } else {
        content.to_string()
    };
    let encrypted = engine.encryption().encrypt(&stored_content)?;

    let init_salience = (0.4 + 0.1 * cls.additional.len() as f64).clamp(0.0, 1.0);

    let mut final_meta = metadata.clone();
    if !cls.additional.is_empty() {
        final_meta.insert(
            "additional_sectors".to_string(),
            serde_json::Value::Array(
                cls.additional
                    .iter()
                    .map(|s| serde_json::Value::String(s.as_str().to_string()))
                    .collect(),
            ),
        );
    }

    let compressed_vec = if cfg.tier == Tier::Smart && mean_vec.len() > SMART_COMPRESS_DIM {
        Some(vec_to_bytes(&compress_to_dim(mean_vec, SMART_COMPRESS_DIM)))
    } else {
        None
    };

    Ok(MemoryRecord {
        id: mid.to_string(),
        user_id: effective_user(user_id),
        segment,
        content: encrypted,
        simhash: simhash.to_string(),
        primary_sector: cls.primary,
        tags: serde_json::to_string(tags).unwrap_or_else(|_| "[]".into()),
        metadata: serde_json::Value::Object(final_meta).to_string(),
        created_at: now_ts,
        updated_at: now_ts,
        last_seen_at: now_ts,
        salience: init_salience,
        decay_lambda: cfg.sector_lambda(cls.primary),
        version: 1,
        mean_dim: Some(mean_vec.len() as i64),
        mean_vec: Some(vec_to_bytes(mean_vec)),
        compressed_vec,
        feedback_score: 0.0,
        generated_summary: None,
    })
}

async fn ensure_user_profile(engine: &Engine, user_id: &str, now_ts: i64) -> Result<()> {
    if engine.store().user_profile(user_id).await?.is_none() {
        engine
            .store()
            .upsert_user_profile(&UserProfile {
                user_id: user_id.to_string(),
                summary: "User profile initializing...".to_string(),
                reflection_count: 0,
                created_at: now_ts,
                updated_at: now_ts,
                metadata: None,
            })
            .await?;
    }
    Ok(())
}

/// Link a freshly inserted memory into the graph: one semantic-gravity edge
/// to its most similar predecessor (self-loop when none exists), plus
/// bi-directional pairs to near-identical same-sector vectors.
pub(crate) async fn link_memory(
    engine: &Engine,
    mid: &str,
    mean_vec: &[f32],
    primary: Sector,
    owner: &str,
    now_ts: i64,
) -> Result<()> {
    // Semantic gravity: strongest predecessor by fused mean similarity
    let candidates = engine
        .store()
        .recent_memories(GRAVITY_SCAN_LIMIT, 0, Some(owner))
        .await?;
    let mut best: Option<(String, f32)> = None;
    for mem in &candidates {
        if mem.id == mid {
            continue;
        }
        let Some(buf) = &mem.mean_vec else { continue };
        let Some(other) = bytes_to_vec(buf) else { continue };
        let sim = cosine_similarity(mean_vec, &other);
        if best.as_ref().map(|(_, b)| sim > *b).unwrap_or(true) {
            best = Some((mem.id.clone(), sim));
        }
    }

    let wp = match best {
        Some((dst, sim)) => Waypoint {
            src_id: mid.to_string(),
            dst_id: dst,
            user_id: owner.to_string(),
            weight: (sim as f64).clamp(0.0, 1.0),
            created_at: now_ts,
            updated_at: now_ts,
        },
        // First memory for this user links to itself
        None => Waypoint {
            src_id: mid.to_string(),
            dst_id: mid.to_string(),
            user_id: owner.to_string(),
            weight: 1.0,
            created_at: now_ts,
            updated_at: now_ts,
        },
    };
    engine.store().upsert_waypoint(&wp).await?;

    // Inter-memory pairs within the primary sector
    let recent = engine
        .vectors()
        .recent_vectors(primary.as_str(), Some(owner), INTER_MEM_SCAN_LIMIT)
        .await?;
    for row in recent {
        if row.id == mid {
            continue;
        }
        let sim = cosine_similarity(mean_vec, &row.vector);
        if sim >= INTER_MEM_THRESHOLD {
            for (src, dst) in [(mid, row.id.as_str()), (row.id.as_str(), mid)] {
                engine
                    .store()
                    .upsert_waypoint(&Waypoint {
                        src_id: src.to_string(),
                        dst_id: dst.to_string(),
                        user_id: owner.to_string(),
                        weight: INTER_MEM_WEIGHT,
                        created_at: now_ts,
                        updated_at: now_ts,
                    })
                    .await?;
            }
        }
    }

    Ok(())
}

/// Batch ingest: one dedup pass, sector-grouped batch embedding, then the
/// same per-memory insertion and linking with incremental segment rotation.
pub async fn add_memories(
    engine: &Engine,
    items: &[IngestRequest],
    user_id: Option<&str>,
) -> Result<Vec<IngestOutcome>> {
    if items.is_empty() {
        return Ok(vec![]);
    }

    let mut outcomes: Vec<Option<IngestOutcome>> = vec![None; items.len()];
    let mut pending: Vec<(usize, String, String, Classification, Vec<Sector>)> = Vec::new();

    // Dedup pass before any embedding work
    for (idx, item) in items.iter().enumerate() {
        let simhash = compute_simhash(&item.content);
        if let Some(existing) = engine.store().memory_by_simhash(&simhash, user_id).await? {
            if hamming_distance(&simhash, &existing.simhash) <= params::HAMMING_THRESHOLD {
                let now = now_ms();
                let boosted = (existing.salience + params::DEDUP_BOOST).min(1.0);
                engine
                    .store()
                    .touch_memory(&existing.id, now, boosted, now, user_id)
                    .await?;
                outcomes[idx] = Some(IngestOutcome::Deduplicated {
                    id: existing.id,
                    primary_sector: existing.primary_sector,
                    salience: boosted,
                    created_at: existing.created_at,
                });
                continue;
            }
        }
        let cls = classifier::classify_content(&item.content, Some(&item.metadata));
        let mut sectors = vec![cls.primary];
        for s in &cls.additional {
            if !sectors.contains(s) {
                sectors.push(*s);
            }
        }
        pending.push((
            idx,
            Uuid::new_v4().to_string(),
            simhash,
            cls,
            sectors,
        ));
    }

    if pending.is_empty() {
        return Ok(outcomes.into_iter().flatten().collect());
    }

    // One batch embedding call per sector across all pending items
    let payload: Vec<(String, String, Vec<Sector>)> = pending
        .iter()
        .map(|(idx, mid, _, _, sectors)| {
            (mid.clone(), items[*idx].content.clone(), sectors.clone())
        })
        .collect();
    let mut batch_embeddings = embed_batch_multi_sector(engine, &payload, user_id).await?;

    let now_ts = now_ms();
    let owner = effective_user(user_id);

    let _write = engine.write_gate().lock().await;
    engine.store().begin().await?;
    let result: Result<()> = async {
        // Segment bookkeeping carries across the loop instead of re-querying
        let mut segment = engine.store().max_segment(user_id).await?;
        let mut seg_count = engine.store().segment_count(segment, user_id).await?;

        for (slot, (idx, mid, simhash, mut cls, mut sectors)) in
            pending.drain(..).enumerate()
        {
            let mut embeddings = std::mem::take(&mut batch_embeddings[slot]);
            let mut mean_vec = fused_mean(&embeddings);
            let content = &items[idx].content;

            if let Some(uid) = user_id {
                if let Some(refined) = engine.learned_refine(uid, &mean_vec, 0.4).await {
                    if !cls.forced && refined.primary != cls.primary {
                        if !sectors.contains(&refined.primary) {
                            match engine.embedder().embed(content, Some(refined.primary)).await {
                                Ok(vec) => {
                                    embeddings.push((refined.primary, vec));
                                    sectors.push(refined.primary);
                                    mean_vec = fused_mean(&embeddings);
                                }
                                Err(e) => {
                                    tracing::warn!("[hsg] batch refinement embed failed: {e}")
                                }
                            }
                        }
                        cls.primary = refined.primary;
                    }
                    for s in refined.additional {
                        if s != cls.primary && !cls.additional.contains(&s) {
                            cls.additional.push(s);
                        }
                    }
                }
            }

            if seg_count >= engine.config().seg_size {
                segment += 1;
                seg_count = 0;
            }
            seg_count += 1;

            let mut record = build_record(
                engine,
                &mid,
                content,
                &simhash,
                &cls,
                &items[idx].tags,
                &items[idx].metadata,
                &mean_vec,
                now_ts,
                user_id,
            )
            .await?;
            record.segment = segment;
            let salience = record.salience;
            engine.store().upsert_memory(&record).await?;

            let vec_rows: Vec<VectorRecord> = embeddings
                .iter()
                .map(|(sector, vec)| {
                    VectorRecord::new(mid.clone(), sector.as_str(), vec.clone())
                        .with_user(owner.clone())
                })
                .collect();
            engine.vectors().store_vectors(&vec_rows).await?;

            link_memory(engine, &mid, &mean_vec, cls.primary, &owner, now_ts).await?;

            outcomes[idx] = Some(IngestOutcome::Stored {
                id: mid,
                primary_sector: cls.primary,
                sectors,
                salience,
                created_at: now_ts,
                simhash,
                chunks: 1,
            });
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => engine.store().commit().await?,
        Err(e) => {
            engine.store().rollback().await?;
            return Err(e);
        }
    }
    drop(_write);

    if let Some(uid) = user_id {
        engine.schedule_summary_refresh(uid);
    }

    Ok(outcomes.into_iter().flatten().collect())
}
