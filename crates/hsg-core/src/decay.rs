//! Salience decay engine
//!
//! A timer-driven pass that samples a slice of each segment, applies
//! sector-specific lambda decay (tier-adjusted), compresses the vectors of
//! fading memories into the `_cold` bucket, and fingerprints the ones that
//! have effectively left working memory. Retrieval calls `on_query_hit` to
//! regenerate a cold vector the moment it matters again.

use crate::dynamics::params;
use crate::embedding::EmbeddingProvider as _;
use crate::engine::{Engine, Result};
use crate::storage::Storage as _;
use crate::text::top_keywords;
use crate::vector_store::VectorStore as _;
use crate::types::{now_ms, MemoryRecord, Sector, VectorRecord};
use crate::vectors::{compress_by_factor, hash_to_vec};
use rand::Rng;

/// Cooldown between decay cycles
const COOLDOWN_MS: i64 = 60_000;
/// Recency window for the HOT tier
const HOT_WINDOW_MS: i64 = 6 * 86_400_000;
/// Reinforcement floor coefficient in the decay formula
const ALPHA_REINFORCE: f64 = 0.1;
/// Dimension of cold-store fingerprints
const FINGERPRINT_DIM: usize = 32;
/// A vector at or below this dimension counts as cold/compressed
const COLD_DIM: usize = 64;

/// Activity tier of a memory, adjusting its effective decay rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    Hot,
    Warm,
    Cold,
}

impl MemoryTier {
    /// Multiplier applied to the base lambda
    pub fn lambda_factor(&self) -> f64 {
        match self {
            MemoryTier::Hot => 0.5,
            MemoryTier::Warm => 1.0,
            MemoryTier::Cold => 1.5,
        }
    }
}

/// Classify a memory by recency and activity.
pub fn pick_tier(m: &MemoryRecord, now: i64) -> MemoryTier {
    let last = if m.last_seen_at > 0 { m.last_seen_at } else { m.updated_at };
    let recent = (now - last).max(0) < HOT_WINDOW_MS;
    let active = m.feedback_score > 5.0 || m.salience > 0.7;
    if recent && active {
        MemoryTier::Hot
    } else if recent || m.salience > 0.4 {
        MemoryTier::Warm
    } else {
        MemoryTier::Cold
    }
}

/// Salience-weighted exponential decay with a small reinforcement floor:
/// `sal * exp(-lambda * days / (sal + 0.1)) + alpha * (1 - exp(-lambda * days))`.
/// High-salience memories decay slower; nothing decays all the way to zero
/// in finite time.
pub fn decayed_salience(lambda: f64, salience: f64, days: f64) -> f64 {
    let f = (-lambda * (days / (salience + 0.1))).exp();
    let floor = ALPHA_REINFORCE * (1.0 - (-lambda * days).exp());
    (salience * f + floor).clamp(0.0, 1.0)
}

/// Outcome of one decay cycle.
#[derive(Debug, Clone, Default)]
pub struct DecayStats {
    pub processed: usize,
    pub changed: usize,
    pub compressed: usize,
    pub fingerprinted: usize,
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
}

/// Run one decay cycle. Skips (returning None) while queries are active or
/// within the cooldown window; foreground traffic always wins.
pub async fn run_decay_cycle(engine: &Engine) -> Result<Option<DecayStats>> {
    let active = engine
        .active_queries()
        .load(std::sync::atomic::Ordering::SeqCst);
    if active > 0 {
        tracing::debug!("[decay] skipped, {active} active queries");
        return Ok(None);
    }
    let now = now_ms();
    let last = engine.last_decay().load(std::sync::atomic::Ordering::SeqCst);
    if now - last < COOLDOWN_MS {
        tracing::debug!("[decay] skipped, cooldown active");
        return Ok(None);
    }
    engine
        .last_decay()
        .store(now, std::sync::atomic::Ordering::SeqCst);

    let cfg = engine.config();
    let started = std::time::Instant::now();
    let mut stats = DecayStats::default();

    let segments = engine.store().segments().await?;
    for segment in segments {
        let rows = engine.store().memories_in_segment(segment).await?;
        if rows.is_empty() {
            continue;
        }

        // Contiguous random sample of decay_ratio of the segment
        let batch_size = ((rows.len() as f64 * cfg.decay_ratio) as usize).max(1);
        let start = if rows.len() > batch_size {
            rand::rng().random_range(0..=rows.len() - batch_size)
        } else {
            0
        };
        let batch = &rows[start..(start + batch_size).min(rows.len())];

        let mut salience_updates: Vec<(f64, i64, String)> = Vec::new();
        for m in batch {
            let tier = pick_tier(m, now);
            match tier {
                MemoryTier::Hot => stats.hot += 1,
                MemoryTier::Warm => stats.warm += 1,
                MemoryTier::Cold => stats.cold += 1,
            }

            let base_lambda = if m.decay_lambda > 0.0 {
                m.decay_lambda
            } else {
                cfg.sector_lambda(m.primary_sector)
            };
            let lambda = base_lambda * tier.lambda_factor();

            let last_ts = if m.last_seen_at > 0 { m.last_seen_at } else { m.updated_at };
            let days = (now - last_ts).max(0) as f64 / 86_400_000.0;

            let f = (-lambda * (days / (m.salience + 0.1))).exp();
            let new_salience = decayed_salience(lambda, m.salience, days);
            let mut changed = (new_salience - m.salience).abs() > 0.001;

            if f < 0.7 && compress_sector_vector(engine, m, f).await? {
                stats.compressed += 1;
                changed = true;
            }

            if f < cfg.decay_cold_threshold.max(0.3) {
                fingerprint_memory(engine, m).await?;
                stats.fingerprinted += 1;
                changed = true;
            }

            if changed {
                salience_updates.push((new_salience, now, m.id.clone()));
                stats.changed += 1;
            }
            stats.processed += 1;
        }

        engine.store().update_salience_batch(&salience_updates).await?;

        // Yield between segments so foreground traffic is not starved
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    if stats.processed > 0 {
        tracing::info!(
            "[decay] {}/{} changed | hot={} warm={} cold={} | comp={} fp={} | {:.1}ms",
            stats.changed,
            stats.processed,
            stats.hot,
            stats.warm,
            stats.cold,
            stats.compressed,
            stats.fingerprinted,
            started.elapsed().as_secs_f64() * 1000.0
        );
        engine
            .store()
            .append_stat("decay", stats.changed as i64, now)
            .await?;
    }

    Ok(Some(stats))
}

/// Compress the memory's main-sector vector toward the cold bucket.
/// Returns true when a smaller vector was actually written.
async fn compress_sector_vector(engine: &Engine, m: &MemoryRecord, f: f64) -> Result<bool> {
    let cfg = engine.config();
    let sector = m.primary_sector.as_str();
    let cold = m.primary_sector.cold_key();

    let vec_row = match engine.vectors().vector(&m.id, sector, None).await? {
        Some(v) => Some((v, false)),
        None => engine
            .vectors()
            .vector(&m.id, &cold, None)
            .await?
            .map(|v| (v, true)),
    };
    let Some((row, already_cold)) = vec_row else {
        return Ok(false);
    };
    if row.vector.len() <= cfg.min_vector_dim {
        return Ok(false);
    }

    let compressed = compress_by_factor(&row.vector, f, cfg.min_vector_dim, cfg.max_vector_dim);
    if compressed.len() >= row.vector.len() {
        return Ok(false);
    }

    engine
        .vectors()
        .store_vector(
            &VectorRecord::new(m.id.clone(), cold.clone(), compressed)
                .with_user(m.user_id.clone()),
        )
        .await?;
    if !already_cold {
        engine.vectors().delete_vectors(&m.id, Some(sector)).await?;
    }
    Ok(true)
}

/// Replace the memory's vector with a 32-float deterministic fingerprint and
/// stash its top keywords as the generated summary.
async fn fingerprint_memory(engine: &Engine, m: &MemoryRecord) -> Result<()> {
    let base_text = match &m.generated_summary {
        Some(s) if !s.is_empty() => s.clone(),
        _ => engine
            .encryption()
            .decrypt(&m.content)
            .unwrap_or_else(|_| m.content.clone()),
    };

    let fp = hash_to_vec(&format!("{}|{}", m.id, base_text), FINGERPRINT_DIM);
    let cold = m.primary_sector.cold_key();
    engine
        .vectors()
        .store_vector(&VectorRecord::new(m.id.clone(), cold, fp).with_user(m.user_id.clone()))
        .await?;
    engine
        .vectors()
        .delete_vectors(&m.id, Some(m.primary_sector.as_str()))
        .await?;

    let summary = top_keywords(&base_text, 3).join(" ");
    engine.store().set_generated_summary(&m.id, &summary).await?;
    Ok(())
}

/// Retrieval hook: when a hit's vector turns out to be cold or compressed
/// (dim <= 64), regenerate the full embedding, restore it to the main sector
/// bucket, drop the cold copy, and bump salience.
pub async fn on_query_hit(
    engine: &Engine,
    mem_id: &str,
    sector: Sector,
    user_id: Option<&str>,
    regenerate: bool,
) -> Result<()> {
    if !regenerate {
        return Ok(());
    }
    let Some(m) = engine.store().memory(mem_id, user_id).await? else {
        return Ok(());
    };

    let main = sector.as_str();
    let vec_row = match engine.vectors().vector(mem_id, main, user_id).await? {
        Some(v) => Some(v),
        None => engine.vectors().vector(mem_id, &sector.cold_key(), user_id).await?,
    };
    let Some(row) = vec_row else {
        return Ok(());
    };
    if row.vector.len() > COLD_DIM {
        return Ok(());
    }

    let base = match &m.generated_summary {
        Some(s) if !s.is_empty() => s.clone(),
        _ => engine.encryption().decrypt(&m.content)?,
    };
    let fresh = engine
        .embedder()
        .embed(&base, Some(sector))
        .await
        .map_err(crate::engine::EngineError::from)?;

    engine
        .vectors()
        .store_vector(&VectorRecord::new(mem_id, main, fresh).with_user(m.user_id.clone()))
        .await?;
    engine
        .vectors()
        .delete_vectors(mem_id, Some(&sector.cold_key()))
        .await?;

    let now = now_ms();
    let boosted = (m.salience + params::QUERY_HIT_BOOST).min(1.0);
    engine
        .store()
        .touch_memory(mem_id, now, boosted, now, user_id)
        .await?;
    tracing::debug!("[decay] regenerated cold vector for {mem_id}");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(salience: f64, last_seen_offset_days: i64, feedback: f64) -> MemoryRecord {
        let now = now_ms();
        MemoryRecord {
            id: "m".into(),
            user_id: "u".into(),
            segment: 0,
            content: "x".into(),
            simhash: "0".repeat(16),
            primary_sector: Sector::Semantic,
            tags: "[]".into(),
            metadata: "{}".into(),
            created_at: now,
            updated_at: now,
            last_seen_at: now - last_seen_offset_days * 86_400_000,
            salience,
            decay_lambda: 0.005,
            version: 1,
            mean_dim: None,
            mean_vec: None,
            compressed_vec: None,
            feedback_score: feedback,
            generated_summary: None,
        }
    }

    #[test]
    fn test_tier_selection() {
        let now = now_ms();
        assert_eq!(pick_tier(&rec(0.9, 1, 10.0), now), MemoryTier::Hot);
        assert_eq!(pick_tier(&rec(0.2, 1, 0.0), now), MemoryTier::Warm);
        assert_eq!(pick_tier(&rec(0.5, 30, 0.0), now), MemoryTier::Warm);
        assert_eq!(pick_tier(&rec(0.1, 30, 0.0), now), MemoryTier::Cold);
    }

    #[test]
    fn test_decay_monotone_in_time() {
        let s0 = decayed_salience(0.02, 0.8, 0.0);
        let s1 = decayed_salience(0.02, 0.8, 10.0);
        let s2 = decayed_salience(0.02, 0.8, 60.0);
        assert!(s0 >= s1);
        assert!(s1 > s2);
        assert!((0.0..=1.0).contains(&s2));
    }

    #[test]
    fn test_decay_high_salience_slower() {
        let low = decayed_salience(0.02, 0.2, 20.0) / 0.2;
        let high = decayed_salience(0.02, 0.9, 20.0) / 0.9;
        // Retained fraction is larger for the high-salience memory
        assert!(high > low);
    }

    #[test]
    fn test_decay_stays_in_bounds() {
        for days in [0.0, 1.0, 30.0, 365.0, 10_000.0] {
            for sal in [0.0, 0.1, 0.5, 1.0] {
                let s = decayed_salience(0.05, sal, days);
                assert!((0.0..=1.0).contains(&s), "s={s} sal={sal} days={days}");
            }
        }
    }

    #[test]
    fn test_tier_lambda_factors() {
        assert_eq!(MemoryTier::Hot.lambda_factor(), 0.5);
        assert_eq!(MemoryTier::Warm.lambda_factor(), 1.0);
        assert_eq!(MemoryTier::Cold.lambda_factor(), 1.5);
    }
}
