//! Reflection
//!
//! Periodically clusters a user's recent near-duplicate memories per sector
//! and synthesizes one reflective memory from each qualifying cluster. The
//! sources are marked consolidated and get a small salience boost, so the
//! pattern survives while the repeats fade through decay.

use crate::engine::{Engine, Result};
use crate::hsg::ingest::{add_memory_inner, IngestOptions};
use crate::storage::Storage as _;
use crate::text::canonical_token_set;
use crate::types::{now_ms, MemoryRecord, Sector};
use crate::vectors::{bytes_to_vec, cosine_similarity};

/// Pairwise similarity threshold for clustering
const CLUSTER_THRESHOLD: f64 = 0.85;
/// A cluster needs at least this many members to reflect
const MIN_CLUSTER_SIZE: usize = 2;
/// Recency half-scale in the cluster salience formula (12 hours)
const RECENCY_TAU_MS: f64 = 43_200_000.0;
/// Salience boost applied to consolidated sources
const SOURCE_BOOST: f64 = 1.1;

/// Outcome of one reflection pass.
#[derive(Debug, Clone, Default)]
pub struct ReflectionOutcome {
    pub created: usize,
    pub clusters: usize,
}

struct Candidate {
    record: MemoryRecord,
    text: String,
    mean: Option<Vec<f32>>,
}

/// Hybrid similarity: cosine on fused mean vectors when both exist, token
/// Jaccard on decrypted content otherwise.
fn similarity(a: &Candidate, b: &Candidate) -> f64 {
    if let (Some(va), Some(vb)) = (&a.mean, &b.mean) {
        return cosine_similarity(va, vb) as f64;
    }
    let sa = canonical_token_set(&a.text);
    let sb = canonical_token_set(&b.text);
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    inter / union
}

fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Cluster salience: population, recency, and emotional weighting.
fn cluster_salience(members: &[&Candidate], now: i64) -> f64 {
    let n = members.len() as f64;
    let population = n / 10.0;

    let recency = members
        .iter()
        .map(|c| (-((now - c.record.created_at).max(0) as f64) / RECENCY_TAU_MS).exp())
        .sum::<f64>()
        / n;

    let emotional = if members[0].record.primary_sector == Sector::Emotional {
        1.0
    } else if members
        .iter()
        .any(|c| c.record.additional_sectors().contains(&Sector::Emotional))
    {
        0.5
    } else {
        0.0
    };

    (0.6 * population + 0.3 * recency + 0.1 * emotional).min(1.0)
}

fn cluster_summary(members: &[&Candidate]) -> String {
    let sector = members[0].record.primary_sector;
    let joined = members
        .iter()
        .map(|c| char_prefix(&c.text, 60))
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} {sector} pattern: {}", members.len(), char_prefix(&joined, 200))
}

/// Run one reflection pass for a user (or the anonymous pool). The whole
/// pass — insertions, consolidation marks, boosts, the stats row — is one
/// transaction.
pub async fn run_reflection(engine: &Engine, user_id: Option<&str>) -> Result<ReflectionOutcome> {
    let cfg = engine.config();
    let mems = engine
        .store()
        .recent_memories(cfg.reflect_limit as i64, 0, user_id)
        .await?;
    if mems.len() < cfg.reflect_min {
        tracing::debug!(
            "[reflect] skipped for {}: {} < {} memories",
            user_id.unwrap_or("all"),
            mems.len(),
            cfg.reflect_min
        );
        return Ok(ReflectionOutcome::default());
    }

    // Decrypt once up front; undecryptable rows drop out of clustering
    let candidates: Vec<Candidate> = mems
        .into_iter()
        .filter(|m| m.primary_sector != Sector::Reflective && !m.is_consolidated())
        .filter_map(|m| {
            let text = engine.encryption().decrypt(&m.content).ok()?;
            let mean = m.mean_vec.as_deref().and_then(bytes_to_vec);
            Some(Candidate {
                record: m,
                text,
                mean,
            })
        })
        .collect();

    // Greedy single-pass clustering within each primary sector
    let mut used = vec![false; candidates.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for i in 0..candidates.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut cluster = vec![i];
        for j in (i + 1)..candidates.len() {
            if used[j] {
                continue;
            }
            if candidates[i].record.primary_sector != candidates[j].record.primary_sector {
                continue;
            }
            if similarity(&candidates[i], &candidates[j]) > CLUSTER_THRESHOLD {
                used[j] = true;
                cluster.push(j);
            }
        }
        if cluster.len() >= MIN_CLUSTER_SIZE {
            clusters.push(cluster);
        }
    }

    if clusters.is_empty() {
        return Ok(ReflectionOutcome::default());
    }
    tracing::info!(
        "[reflect] {} clusters for {}",
        clusters.len(),
        user_id.unwrap_or("all")
    );

    let now = now_ms();
    let _write = engine.write_gate().lock().await;
    engine.store().begin().await?;
    let result: Result<usize> = async {
        let mut created = 0usize;
        for cluster in &clusters {
            let members: Vec<&Candidate> = cluster.iter().map(|i| &candidates[*i]).collect();
            let summary = cluster_summary(&members);
            let salience = cluster_salience(&members, now);
            let source_ids: Vec<String> =
                members.iter().map(|c| c.record.id.clone()).collect();

            let mut meta = serde_json::Map::new();
            meta.insert("sector".into(), "reflective".into());
            meta.insert("type".into(), "auto_reflect".into());
            meta.insert(
                "sources".into(),
                serde_json::Value::Array(
                    source_ids.iter().map(|s| s.clone().into()).collect(),
                ),
            );
            meta.insert("freq".into(), (members.len() as i64).into());

            let outcome = add_memory_inner(
                engine,
                &summary,
                &["reflect:auto".to_string()],
                &meta,
                user_id,
                IngestOptions::default(),
                false,
            )
            .await?;

            // The synthesized memory carries the cluster's computed salience
            if !outcome.deduplicated() {
                engine
                    .store()
                    .touch_memory(outcome.id(), now, salience, now, user_id)
                    .await?;
            }

            engine.store().mark_consolidated(&source_ids, now).await?;
            engine
                .store()
                .scale_salience(&source_ids, SOURCE_BOOST, now)
                .await?;
            created += 1;
        }
        if created > 0 {
            engine.store().append_stat("reflect", created as i64, now).await?;
            if let Some(uid) = user_id {
                engine.store().bump_reflection_count(uid).await?;
            }
        }
        Ok(created)
    }
    .await;

    let created = match result {
        Ok(n) => {
            engine.store().commit().await?;
            n
        }
        Err(e) => {
            engine.store().rollback().await?;
            return Err(e);
        }
    };

    tracing::info!("[reflect] created {created} reflections");
    Ok(ReflectionOutcome {
        created,
        clusters: clusters.len(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, sector: Sector, text: &str, mean: Option<Vec<f32>>) -> Candidate {
        let now = now_ms();
        Candidate {
            record: MemoryRecord {
                id: id.into(),
                user_id: "u".into(),
                segment: 0,
                content: text.into(),
                simhash: "0".repeat(16),
                primary_sector: sector,
                tags: "[]".into(),
                metadata: "{}".into(),
                created_at: now,
                updated_at: now,
                last_seen_at: now,
                salience: 0.5,
                decay_lambda: 0.02,
                version: 1,
                mean_dim: None,
                mean_vec: None,
                compressed_vec: None,
                feedback_score: 0.0,
                generated_summary: None,
            },
            text: text.into(),
            mean,
        }
    }

    #[test]
    fn test_similarity_prefers_vectors() {
        let a = cand("a", Sector::Semantic, "anything", Some(vec![1.0, 0.0]));
        let b = cand("b", Sector::Semantic, "unrelated words", Some(vec![1.0, 0.0]));
        assert!((similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_jaccard_fallback() {
        let a = cand("a", Sector::Semantic, "excited about machine learning", None);
        let b = cand("b", Sector::Semantic, "excited about machine learning", None);
        let c = cand("c", Sector::Semantic, "totally different topic entirely", None);
        assert!(similarity(&a, &b) > 0.99);
        assert!(similarity(&a, &c) < 0.2);
    }

    #[test]
    fn test_cluster_salience_weights() {
        let now = now_ms();
        let a = cand("a", Sector::Emotional, "so excited", None);
        let b = cand("b", Sector::Emotional, "really excited", None);
        let members = vec![&a, &b];
        let s = cluster_salience(&members, now);
        // 0.6*(2/10) + 0.3*~1.0 + 0.1*1.0 ~= 0.52
        assert!(s > 0.45 && s < 0.6);
    }

    #[test]
    fn test_cluster_summary_shape() {
        let a = cand("a", Sector::Emotional, "excited about the AI roadmap for next year", None);
        let b = cand("b", Sector::Emotional, "excited about AI progress overall", None);
        let members = vec![&a, &b];
        let s = cluster_summary(&members);
        assert!(s.starts_with("2 emotional pattern:"));
        assert!(s.len() <= 230);
    }

    #[test]
    fn test_char_prefix_utf8_safe() {
        assert_eq!(char_prefix("héllo wörld", 5), "héllo");
        assert_eq!(char_prefix("ab", 60), "ab");
    }
}
