//! Retrieval pipeline
//!
//! Multi-sector candidate generation with iterative expansion, waypoint BFS
//! when vector confidence is low, hybrid scoring with cross-sector penalties,
//! z-score normalization of the final set, then trace reinforcement and
//! co-activation recording for everything that surfaced.

use super::embed::embed_query_for_sectors;
use crate::classifier;
use crate::decay;
use crate::dynamics::{self, params};
use crate::engine::{Engine, Result};
use crate::storage::Storage as _;
use crate::text::{canonical_token_set, has_temporal_markers, token_overlap};
use crate::vector_store::VectorStore as _;
use crate::types::{
    now_ms, MemoryItem, MemoryRecord, ScoreBreakdown, SearchFilters, Sector, Trace,
};
use crate::vector_store::{VectorFilters, VectorMatch};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Expansion multiplier hard cap
const MAX_MULTIPLIER: usize = 60;
/// BFS frontier cap per layer
const BFS_LAYER_LIMIT: usize = 50;
/// Query cache TTL
const CACHE_TTL_MS: i64 = 60_000;

/// A candidate reached through the waypoint graph rather than vector search.
#[derive(Debug, Clone)]
pub struct Expanded {
    pub id: String,
    pub weight: f64,
    pub path: Vec<String>,
}

/// Layer-based BFS over the waypoint graph. Edge weights decay by 0.8 per
/// hop; traversal stops below weight 0.1, at `max_exp` results, or when the
/// frontier drains. Neighbor fetches are batched per layer.
pub async fn expand_via_waypoints(
    engine: &Engine,
    seed_ids: &[String],
    max_exp: usize,
    user_id: Option<&str>,
) -> Result<Vec<Expanded>> {
    if seed_ids.is_empty() {
        return Ok(vec![]);
    }

    let mut visited: HashSet<String> = seed_ids.iter().cloned().collect();
    let mut results: Vec<Expanded> = Vec::new();
    let mut frontier: Vec<(String, f64, Vec<String>)> = seed_ids
        .iter()
        .map(|id| (id.clone(), 1.0, vec![id.clone()]))
        .collect();

    while !frontier.is_empty() && results.len() < max_exp {
        let current_ids: Vec<String> = frontier.iter().map(|(id, _, _)| id.clone()).collect();
        let by_id: HashMap<String, (f64, Vec<String>)> = frontier
            .drain(..)
            .map(|(id, w, path)| (id, (w, path)))
            .collect();

        let edges = engine.store().neighbors(&current_ids, user_id).await?;
        for edge in edges {
            if results.len() >= max_exp {
                break;
            }
            if visited.contains(&edge.dst_id) {
                continue;
            }
            let Some((parent_weight, parent_path)) = by_id.get(&edge.src_id) else {
                continue;
            };
            let weight = edge.weight.clamp(0.0, 1.0);
            let propagated = parent_weight * weight * params::WAYPOINT_DECAY;
            if propagated < params::EXPANSION_MIN_WEIGHT {
                continue;
            }

            let mut path = parent_path.clone();
            path.push(edge.dst_id.clone());
            visited.insert(edge.dst_id.clone());
            results.push(Expanded {
                id: edge.dst_id.clone(),
                weight: propagated,
                path: path.clone(),
            });
            if frontier.len() < BFS_LAYER_LIMIT {
                frontier.push((edge.dst_id, propagated, path));
            }
        }
    }

    Ok(results)
}

/// Per-sector dimension weights, biased toward the query's primary sector.
fn dimension_weights(query_primary: Sector) -> HashMap<Sector, f64> {
    let mut w = HashMap::new();
    w.insert(
        Sector::Semantic,
        if query_primary == Sector::Semantic { 1.2 } else { 0.8 },
    );
    w.insert(
        Sector::Emotional,
        if query_primary == Sector::Emotional { 1.5 } else { 0.6 },
    );
    w.insert(
        Sector::Procedural,
        if query_primary == Sector::Procedural { 1.3 } else { 0.7 },
    );
    w.insert(
        Sector::Episodic,
        if query_primary == Sector::Episodic { 1.4 } else { 0.7 },
    );
    w.insert(
        Sector::Reflective,
        if query_primary == Sector::Reflective { 1.1 } else { 0.5 },
    );
    w
}

/// Weighted cosine across a memory's sector vectors and the per-sector query
/// embeddings. Cold vectors have no query-side counterpart and drop out.
fn multi_vector_fusion(
    vecs: &[crate::types::VectorRecord],
    query_embeddings: &HashMap<String, Vec<f32>>,
    weights: &HashMap<Sector, f64>,
) -> f64 {
    let mut sum = 0.0;
    let mut total = 0.0;
    for v in vecs {
        let Some(qv) = query_embeddings.get(&v.sector) else {
            continue;
        };
        let sim = crate::vectors::cosine_similarity(&v.vector, qv) as f64;
        let w = weights
            .get(&Sector::parse_name(&v.sector))
            .copied()
            .unwrap_or(0.5);
        sum += sim * w;
        total += w;
    }
    if total > 0.0 {
        sum / total
    } else {
        0.0
    }
}

fn tag_match_score(tags: &[String], query_tokens: &BTreeSet<String>) -> f64 {
    if tags.is_empty() {
        return 0.0;
    }
    let mut matches = 0usize;
    for tag in tags {
        let tl = tag.to_lowercase();
        if query_tokens.contains(&tl) {
            matches += 2;
        } else {
            for tok in query_tokens {
                if tl.contains(tok.as_str()) || tok.contains(&tl) {
                    matches += 1;
                }
            }
        }
    }
    (matches as f64 / (tags.len() * 2) as f64).min(1.0)
}

/// Readable justification for why a memory surfaced.
fn generate_trace(metrics: &ScoreBreakdown, primary: Sector) -> String {
    let mut just = format!("Recalled via {primary} resonance");
    if metrics.sim_adj > 0.6 {
        just.push_str(&format!(" (high semantic similarity: {:.2})", metrics.sim_adj));
    } else if metrics.tok_ov > 0.4 {
        just.push_str(&format!(" (strong keyword overlap: {:.2})", metrics.tok_ov));
    }
    if metrics.waypoint > 0.2 {
        just.push_str(&format!(
            ", linked via associative waypoint ({:.2})",
            metrics.waypoint
        ));
    }
    if metrics.recency > 0.8 {
        just.push_str(", reinforced by recent interaction");
    } else if metrics.recency < 0.2 {
        just.push_str(", retrieved from long-term memory");
    }
    if metrics.tag > 0.5 {
        just.push_str(" (matched user tags)");
    }
    just
}

fn passes_row_filters(m: &MemoryRecord, f: &SearchFilters) -> bool {
    if let Some(min) = f.min_salience {
        if m.salience < min {
            return false;
        }
    }
    if let Some(u) = &f.user_id {
        if !m.user_id.is_empty() && m.user_id != *u {
            return false;
        }
    }
    if let Some(start) = f.start_time {
        if m.created_at < start {
            return false;
        }
    }
    if let Some(end) = f.end_time {
        if m.created_at > end {
            return false;
        }
    }
    if let Some(tags) = &f.tags {
        if !tags.is_empty() {
            let mem_tags = m.tag_list();
            if !tags.iter().any(|t| mem_tags.contains(t)) {
                return false;
            }
        }
    }
    true
}

struct ActiveQueryGuard<'a>(&'a std::sync::atomic::AtomicI64);

impl Drop for ActiveQueryGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

// ============================================================================
// SEARCH
// ============================================================================

/// The full retrieval pipeline. Never fails on per-row problems; a memory
/// that cannot be decrypted or decoded is logged and skipped.
pub async fn search(
    engine: &Engine,
    query_text: &str,
    k: usize,
    filters: &SearchFilters,
) -> Result<Vec<MemoryItem>> {
    let k = k.max(1);

    // Gate decay while queries are in flight
    engine
        .active_queries()
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let _guard = ActiveQueryGuard(engine.active_queries());

    let cache_key = format!("{query_text}:{k}:{}", filters.cache_key_part());
    if let Some(hit) = engine.cached_query(&cache_key, CACHE_TTL_MS) {
        return Ok(hit);
    }

    // Classify the query and tokenize it once
    let mut qc = classifier::classify_content(query_text, None);
    let query_tokens = canonical_token_set(query_text);

    if has_temporal_markers(query_text) {
        tracing::info!("[hsg] temporal marker detected in query");
    }

    let sectors: Vec<Sector> = filters
        .sectors
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Sector::ALL.to_vec());

    // Per-sector query embeddings
    let qe_pairs = embed_query_for_sectors(engine, query_text, &sectors).await?;
    let query_embeddings: HashMap<String, Vec<f32>> = qe_pairs
        .iter()
        .map(|(s, v)| (s.as_str().to_string(), v.clone()))
        .collect();

    // Learned refinement on the fused query mean
    if let Some(uid) = &filters.user_id {
        let q_mean = crate::embedding::fused_mean(&qe_pairs);
        if let Some(refined) = engine.learned_refine(uid, &q_mean, 0.5).await {
            if refined.primary != qc.primary {
                tracing::info!(
                    "[hsg] query refined for {uid}: {} -> {}",
                    qc.primary,
                    refined.primary
                );
                qc.primary = refined.primary;
            }
            for s in refined.additional {
                if s != qc.primary && !qc.additional.contains(&s) {
                    qc.additional.push(s);
                }
            }
        }
    }

    let query_sectors: Vec<Sector> = {
        let mut v = vec![qc.primary];
        v.extend(qc.additional.iter().copied());
        v
    };
    let dim_weights = dimension_weights(qc.primary);

    let vector_filters = VectorFilters {
        user_id: filters.user_id.clone(),
        metadata: filters.metadata.clone(),
    };

    // Candidate generation per sector with iterative expansion: when
    // post-filters starve the candidate set, double the multiplier until the
    // store saturates or the cap is hit.
    let mut sector_hits: HashMap<Sector, Vec<VectorMatch>> = HashMap::new();
    for sector in &sectors {
        let Some(qv) = query_embeddings.get(sector.as_str()) else {
            continue;
        };
        let base_mult = if filters.has_post_filters() { 5 } else { 2 };
        let mut multiplier = base_mult;
        let hits = loop {
            let requested = k * multiplier;
            let res = engine
                .vectors()
                .search(qv, sector.as_str(), requested, &vector_filters)
                .await?;
            if res.is_empty() || !filters.has_post_filters() || res.len() < k {
                break res;
            }
            // Validate against the row store before trusting the batch
            let ids: Vec<String> = res.iter().map(|r| r.id.clone()).collect();
            let rows = engine.store().memories_by_ids(&ids, None).await?;
            let valid = rows.iter().filter(|m| passes_row_filters(m, filters)).count();
            if valid >= k || res.len() < requested {
                break res;
            }
            multiplier *= 2;
            if multiplier > MAX_MULTIPLIER {
                tracing::warn!("[hsg] expansion hit {multiplier}x cap for sector {sector}");
                break res;
            }
        };
        sector_hits.insert(*sector, hits);
    }

    // Vector-confidence estimate over the top slice of each sector
    let mut top_sims: Vec<f32> = Vec::new();
    for hits in sector_hits.values() {
        top_sims.extend(hits.iter().take(8).map(|h| h.score));
    }
    let avg_top = if top_sims.is_empty() {
        0.0
    } else {
        top_sims.iter().sum::<f32>() as f64 / top_sims.len() as f64
    };
    let adaptive_expansion = (0.3 * k as f64 * (1.0 - avg_top)).ceil() as usize;
    let effective_k = k + adaptive_expansion;
    let high_confidence = avg_top >= params::LOW_CONFIDENCE_THRESHOLD;

    let mut candidate_ids: BTreeSet<String> = sector_hits
        .values()
        .flatten()
        .map(|h| h.id.clone())
        .collect();

    // Graph expansion only when vectors alone look weak
    let expanded = if high_confidence {
        vec![]
    } else {
        let seeds: Vec<String> = candidate_ids.iter().cloned().collect();
        let exp =
            expand_via_waypoints(engine, &seeds, k * 2, filters.user_id.as_deref()).await?;
        for e in &exp {
            candidate_ids.insert(e.id.clone());
        }
        exp
    };

    if candidate_ids.is_empty() {
        engine.cache_query(&cache_key, vec![]);
        return Ok(vec![]);
    }

    // Bulk fetch rows and all candidate vectors
    let id_list: Vec<String> = candidate_ids.into_iter().collect();
    let rows = engine.store().memories_by_ids(&id_list, None).await?;
    let vec_map = engine
        .vectors()
        .vectors_by_ids(&id_list, filters.user_id.as_deref())
        .await?;

    let expansion_by_id: HashMap<&str, &Expanded> =
        expanded.iter().map(|e| (e.id.as_str(), e)).collect();
    let now = now_ms();
    let cfg = engine.config();

    let mut scored: Vec<MemoryItem> = Vec::new();
    for m in &rows {
        if !passes_row_filters(m, filters) {
            continue;
        }

        // Per-row decryption failures skip the row, never the query
        let content = match engine.encryption().decrypt(&m.content) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("[hsg] skipping {}: decryption failed: {e}", m.id);
                continue;
            }
        };

        let empty = Vec::new();
        let vecs = vec_map.get(&m.id).unwrap_or(&empty);
        let fusion = multi_vector_fusion(vecs, &query_embeddings, &dim_weights);
        let resonant = dynamics::cross_sector_resonance(m.primary_sector, qc.primary, fusion);

        let mut best_sim = resonant;
        for hits in sector_hits.values() {
            for hit in hits {
                if hit.id == m.id && hit.score as f64 > best_sim {
                    best_sim = hit.score as f64;
                }
            }
        }

        let penalty = if m.primary_sector != qc.primary
            && !query_sectors.contains(&m.primary_sector)
        {
            dynamics::sector_penalty(qc.primary, m.primary_sector)
        } else {
            1.0
        };
        let sim_adj = best_sim * penalty;

        let (waypoint_weight, path) = match expansion_by_id.get(m.id.as_str()) {
            Some(e) => (e.weight.clamp(0.0, 1.0), e.path.clone()),
            None => (0.0, vec![m.id.clone()]),
        };

        let days_since = (now - m.last_seen_at).max(0) as f64 / 86_400_000.0;
        let live_salience = decay::decayed_salience(
            cfg.sector_lambda(m.primary_sector),
            m.salience,
            days_since,
        );

        let mem_tokens = canonical_token_set(&content);
        let tok_ov = token_overlap(&query_tokens, &mem_tokens);
        let recency = dynamics::recency_score(m.last_seen_at, now);
        let tag = tag_match_score(&m.tag_list(), &query_tokens);
        let keyword_score = if cfg.tier == crate::config::Tier::Hybrid {
            tok_ov * cfg.keyword_boost
        } else {
            0.0
        };

        let metrics = ScoreBreakdown {
            sim_adj,
            tok_ov,
            recency,
            waypoint: waypoint_weight,
            tag,
            penalty,
        };
        let score = dynamics::hybrid_score(
            engine.scoring(),
            sim_adj,
            tok_ov,
            waypoint_weight,
            recency,
            keyword_score,
            tag,
        );

        let mut item = MemoryItem::from_record(m, content);
        item.salience = live_salience;
        item.score = Some(score);
        item.trace = Some(Trace {
            justification: generate_trace(&metrics, m.primary_sector),
            metrics: metrics.clone(),
            path,
        });
        if filters.debug {
            item.debug = Some(metrics);
        }
        scored.push(item);
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(effective_k);

    // Z-score normalize within the effective set, then take the final k
    if !scored.is_empty() {
        let vals: Vec<f64> = scored.iter().filter_map(|r| r.score).collect();
        let mean = vals.iter().sum::<f64>() / vals.len() as f64;
        let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / vals.len() as f64;
        let std = var.sqrt() + params::EPSILON;
        for r in scored.iter_mut() {
            if let Some(s) = r.score {
                r.score = Some((s - mean) / std);
            }
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    scored.truncate(k);

    reinforce_results(engine, &scored, filters.user_id.as_deref(), now).await?;

    engine.spawn_coactivation_worker();
    engine.cache_query(&cache_key, scored.clone());
    Ok(scored)
}

// ============================================================================
// REINFORCEMENT
// ============================================================================

/// Trace reinforcement over the final result set: feedback EMA, salience
/// bump, path edge boosts, neighbor propagation, co-activation recording,
/// and cold-vector regeneration.
async fn reinforce_results(
    engine: &Engine,
    results: &[MemoryItem],
    user_id: Option<&str>,
    now: i64,
) -> Result<()> {
    let owner = user_id.unwrap_or("anonymous").to_string();
    let result_ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    let reinf = engine.reinforcement();

    for r in results {
        let score = r.score.unwrap_or(0.0);
        let new_feedback =
            r.feedback_score * (1.0 - params::FEEDBACK_EMA_ALPHA) + score * params::FEEDBACK_EMA_ALPHA;
        engine
            .store()
            .update_feedback(&r.id, new_feedback, user_id)
            .await?;

        // Unordered co-activation pairs among the top results
        for other in &result_ids {
            if r.id.as_str() < *other {
                engine.record_coactivation(&owner, &r.id, other);
            }
        }

        let new_salience = dynamics::trace_reinforce(r.salience);
        engine
            .store()
            .touch_memory(&r.id, now, new_salience, now, user_id)
            .await?;

        // Reinforce the traversal path's edges
        let path = r.path();
        if path.len() > 1 {
            engine
                .store()
                .bump_waypoints(
                    path,
                    reinf.waypoint_boost,
                    reinf.max_waypoint_weight,
                    &owner,
                    now,
                )
                .await?;
        }

        // Associative propagation to direct neighbors
        let edges = engine
            .store()
            .neighbors(&[r.id.clone()], user_id)
            .await?;
        if !edges.is_empty() {
            let neighbor_ids: Vec<String> = edges.iter().map(|e| e.dst_id.clone()).collect();
            let neighbor_rows = engine.store().memories_by_ids(&neighbor_ids, user_id).await?;
            let salience_by_id: HashMap<&str, f64> = neighbor_rows
                .iter()
                .map(|m| (m.id.as_str(), m.salience))
                .collect();
            let inputs: Vec<(String, f64, f64)> = edges
                .iter()
                .filter_map(|e| {
                    salience_by_id
                        .get(e.dst_id.as_str())
                        .map(|s| (e.dst_id.clone(), e.weight, *s))
                })
                .collect();
            let updates = dynamics::propagate_reinforcement(new_salience, &inputs);
            let batch: Vec<(f64, i64, String)> = updates
                .into_iter()
                .map(|(id, salience)| (salience, now, id))
                .collect();
            engine.store().update_salience_batch(&batch).await?;
        }

        // Regenerate cold/compressed vectors that just got hit
        if let Err(e) =
            decay::on_query_hit(engine, &r.id, r.primary_sector, user_id, true).await
        {
            tracing::warn!("[hsg] on_query_hit for {} failed: {e}", r.id);
        }
    }

    Ok(())
}

// ============================================================================
// CO-ACTIVATION WORKER
// ============================================================================

/// Drain up to one batch of recorded co-activation pairs, strengthening each
/// edge by the temporally-weighted learning rule. Pairs across users are
/// dropped. Runs as a detached task after each query.
pub(crate) async fn drain_coactivations(engine: &Engine) -> Result<()> {
    let pairs = engine.take_coactivation_batch(50);
    if pairs.is_empty() {
        return Ok(());
    }

    let mut unique_ids: BTreeSet<String> = BTreeSet::new();
    for (_, a, b) in &pairs {
        unique_ids.insert(a.clone());
        unique_ids.insert(b.clone());
    }
    let id_list: Vec<String> = unique_ids.into_iter().collect();
    let rows = engine.store().memories_by_ids(&id_list, None).await?;
    let by_id: HashMap<&str, &MemoryRecord> =
        rows.iter().map(|m| (m.id.as_str(), m)).collect();

    let now = now_ms();
    for (uid, a, b) in &pairs {
        let (Some(ma), Some(mb)) = (by_id.get(a.as_str()), by_id.get(b.as_str())) else {
            continue;
        };
        if ma.user_id != mb.user_id || ma.user_id != *uid {
            continue;
        }

        let dt = (ma.last_seen_at - mb.last_seen_at).abs();
        let existing = engine.store().waypoint(a, b).await?;
        let current = existing.as_ref().map(|w| w.weight).unwrap_or(0.0);
        let new_weight = dynamics::coactivation_weight(current, dt);

        engine
            .store()
            .upsert_waypoint(&crate::types::Waypoint {
                src_id: a.clone(),
                dst_id: b.clone(),
                user_id: existing
                    .map(|w| w.user_id)
                    .unwrap_or_else(|| uid.clone()),
                weight: new_weight,
                created_at: now,
                updated_at: now,
            })
            .await?;
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_weights_bias_primary() {
        let w = dimension_weights(Sector::Episodic);
        assert!((w[&Sector::Episodic] - 1.4).abs() < 1e-9);
        assert!((w[&Sector::Semantic] - 0.8).abs() < 1e-9);
        let w = dimension_weights(Sector::Emotional);
        assert!((w[&Sector::Emotional] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_tag_match_score() {
        let toks: BTreeSet<String> = ["paris", "travel"].iter().map(|s| s.to_string()).collect();
        // Exact tag hit counts double
        let exact = tag_match_score(&["paris".into()], &toks);
        assert!((exact - 1.0).abs() < 1e-9);
        // Substring hit counts single
        let partial = tag_match_score(&["paristravel2024".into()], &toks);
        assert!(partial > 0.0 && partial < 1.0);
        assert_eq!(tag_match_score(&[], &toks), 0.0);
    }

    #[test]
    fn test_trace_justification_mentions_signals() {
        let metrics = ScoreBreakdown {
            sim_adj: 0.9,
            tok_ov: 0.1,
            recency: 0.9,
            waypoint: 0.4,
            tag: 0.6,
            penalty: 1.0,
        };
        let t = generate_trace(&metrics, Sector::Episodic);
        assert!(t.contains("episodic"));
        assert!(t.contains("semantic similarity"));
        assert!(t.contains("waypoint"));
        assert!(t.contains("recent interaction"));
        assert!(t.contains("tags"));
    }

    #[test]
    fn test_row_filters() {
        let mut m = MemoryRecord {
            id: "a".into(),
            user_id: "u1".into(),
            segment: 0,
            content: String::new(),
            simhash: "0".repeat(16),
            primary_sector: Sector::Semantic,
            tags: r#"["work"]"#.into(),
            metadata: "{}".into(),
            created_at: 1000,
            updated_at: 1000,
            last_seen_at: 1000,
            salience: 0.5,
            decay_lambda: 0.02,
            version: 1,
            mean_dim: None,
            mean_vec: None,
            compressed_vec: None,
            feedback_score: 0.0,
            generated_summary: None,
        };
        let mut f = SearchFilters {
            user_id: Some("u1".into()),
            min_salience: Some(0.4),
            start_time: Some(500),
            end_time: Some(2000),
            tags: Some(vec!["work".into()]),
            ..Default::default()
        };
        assert!(passes_row_filters(&m, &f));

        f.min_salience = Some(0.9);
        assert!(!passes_row_filters(&m, &f));
        f.min_salience = None;

        m.user_id = "u2".into();
        assert!(!passes_row_filters(&m, &f));
    }
}
